//! Core Driver trait: the pluggable policy backend.
//!
//! A driver compiles template source code for one engine and evaluates
//! constraints against review payloads or its own ingested data. The client
//! keys drivers by `name()`, which is also the engine name templates use in
//! their `code` entries.

use serde_json::Value;

use crate::constraint::Constraint;
use crate::context::Context;
use crate::error::DriverError;
use crate::result::{QueryOpts, StatsEntry, ViolationResult};
use crate::template::ConstraintTemplate;

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Location of a referential data entry inside a target's data tree,
/// e.g. `["namespace", "default", "v1", "Pod", "web-0"]`.
pub type StoragePath = Vec<String>;

/// What a driver returns for one query.
#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    pub results: Vec<ViolationResult>,
    pub stats: Vec<StatsEntry>,
    pub trace: Option<String>,
}

/// Pluggable evaluation backend.
///
/// Implementations must be internally synchronized: the client calls them
/// concurrently from Review/Audit and from data ingestion.
pub trait Driver: Send + Sync {
    /// Engine name, matched against `code[].engine` in templates.
    fn name(&self) -> &str;

    /// Compile and load a template, replacing any previous version.
    fn add_template(&self, ctx: &Context, template: &ConstraintTemplate) -> DriverResult<()>;

    /// Unload a template. Unknown templates are not an error.
    fn remove_template(&self, ctx: &Context, template: &ConstraintTemplate) -> DriverResult<()>;

    /// Store a constraint, replacing any previous version with the same Kind and name.
    fn add_constraint(&self, ctx: &Context, constraint: &Constraint) -> DriverResult<()>;

    /// Forget a constraint. Unknown constraints are not an error.
    fn remove_constraint(&self, ctx: &Context, constraint: &Constraint) -> DriverResult<()>;

    /// Whether this driver stores referential data for cross-object policies.
    fn supports_referential_data(&self) -> bool {
        false
    }

    fn add_data(
        &self,
        _ctx: &Context,
        _target: &str,
        _key: &[String],
        _value: &Value,
    ) -> DriverResult<()> {
        Ok(())
    }

    fn remove_data(&self, _ctx: &Context, _target: &str, _key: &[String]) -> DriverResult<()> {
        Ok(())
    }

    /// Evaluate `constraints` for `target`.
    ///
    /// With `Some(review)` the constraints have already been matched against
    /// that review payload. With `None` this is an audit: evaluate the
    /// constraints against everything ingested for `target`.
    fn query(
        &self,
        ctx: &Context,
        target: &str,
        constraints: &[Constraint],
        review: Option<&Value>,
        opts: &QueryOpts,
    ) -> DriverResult<QueryResponse>;

    /// Diagnostic dump of the driver's state.
    fn dump(&self, ctx: &Context) -> DriverResult<String>;
}
