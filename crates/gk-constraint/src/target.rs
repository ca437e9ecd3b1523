//! TargetHandler trait: adapts one target domain to the engine.
//!
//! A target decides which inputs it claims, shapes them into review
//! payloads, turns side-channel objects into referential data entries, and
//! owns the meaning of a constraint's `spec.match` block.

use serde_json::Value;

use crate::constraint::Constraint;
use crate::driver::StoragePath;
use crate::error::TargetError;
use crate::result::ViolationResult;

pub type TargetResult<T> = std::result::Result<T, TargetError>;

/// Compiled match criteria of one constraint for one target.
pub trait Matcher: Send + Sync {
    /// Whether the constraint applies to `review`. An error means the
    /// criteria could not be evaluated; the engine rejects the review.
    fn matches(&self, review: &Value) -> TargetResult<bool>;
}

/// Optional target-side copy of referential data (e.g. namespaces needed
/// to evaluate namespace selectors).
pub trait DataCache: Send + Sync {
    fn add(&self, key: &[String], value: &Value) -> TargetResult<()>;
    fn remove(&self, key: &[String]);

    /// The value cached under `key`. Caches that keep only some entries
    /// return `None` for the rest.
    fn lookup(&self, key: &[String]) -> Option<Value>;
}

pub trait TargetHandler: Send + Sync {
    /// Unique target name, e.g. "admission.k8s.gatekeeper.sh".
    fn name(&self) -> &str;

    /// Schema of `spec.match` for constraints of this target.
    fn match_schema(&self) -> Value;

    /// Turn an object into a referential data entry.
    /// `Ok(None)` means the target does not claim the object.
    fn process_data(&self, object: &Value) -> TargetResult<Option<(StoragePath, Value)>>;

    /// Shape an object into this target's review payload.
    /// `Ok(None)` means the target does not claim the object.
    fn handle_review(&self, object: &Value) -> TargetResult<Option<Value>>;

    /// Attach target-specific details to a result before it is returned.
    fn handle_violation(&self, result: &mut ViolationResult) -> TargetResult<()>;

    /// Target-specific semantic checks on a constraint.
    fn validate_constraint(&self, constraint: &Constraint) -> TargetResult<()>;

    /// Compile the constraint's match criteria.
    fn to_matcher(&self, constraint: &Constraint) -> TargetResult<Box<dyn Matcher>>;

    /// Policy-library boilerplate drivers may load for this target.
    fn library(&self) -> &str;

    fn cache(&self) -> Option<&dyn DataCache> {
        None
    }
}
