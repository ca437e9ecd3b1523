// error.rs — Error types for the constraint engine.
//
// Structural problems (bad templates, bad constraints, unknown kinds) fail a
// call outright. Query-time problems are isolated per target and collected
// into an ErrorMap that travels alongside whatever results were produced.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Errors raised by a policy backend.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver was asked about a template it has not loaded.
    #[error("template '{0}' is not loaded")]
    UnknownTemplate(String),

    /// The template's source code could not be compiled by this engine.
    #[error("compile error in template '{template}': {message}")]
    Compile { template: String, message: String },

    /// Evaluation failed.
    #[error("query failed: {0}")]
    Query(String),

    /// Backend storage (templates, constraints or referential data) failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The caller's context was cancelled or its deadline passed.
    #[error("operation cancelled")]
    Cancelled,
}

/// Errors raised by a target handler.
#[derive(Debug, Error)]
pub enum TargetError {
    /// The object could not be shaped into a review or data entry.
    #[error("malformed object: {0}")]
    Malformed(String),

    /// The constraint is semantically invalid for this target.
    #[error("{0}")]
    InvalidConstraint(String),

    /// Match criteria could not be evaluated against a review.
    #[error("{0}")]
    Match(String),

    /// The target's data cache rejected an entry.
    #[error("cache error: {0}")]
    Cache(String),
}

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Bad template metadata, target declarations, or parameter schema.
    #[error("invalid ConstraintTemplate: {0}")]
    InvalidConstraintTemplate(String),

    /// A template with live constraints tried to move to a different target set.
    #[error(
        "ConstraintTemplate '{template}' has constraints; cannot change targets from {old:?} to {new:?}"
    )]
    ChangeTargets {
        template: String,
        old: Vec<String>,
        new: Vec<String>,
    },

    /// None of the template's engines has a registered driver.
    #[error("no driver available for ConstraintTemplate '{template}' (engines: {engines:?})")]
    NoDriver {
        template: String,
        engines: Vec<String>,
    },

    /// Operation against a template name or Kind that is not registered.
    #[error("missing ConstraintTemplate '{0}'")]
    MissingConstraintTemplate(String),

    /// Bad constraint metadata, group mismatch, or schema violation.
    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),

    /// The constraint instance is not registered.
    #[error("missing constraint {kind}/{name}")]
    MissingConstraint { kind: String, name: String },

    /// Referential data was submitted but no driver can store it.
    #[error("no driver supporting referential data is registered")]
    NoReferentialDriver,

    /// A driver call failed.
    #[error("driver '{driver}': {source}")]
    Driver {
        driver: String,
        #[source]
        source: DriverError,
    },

    /// A target handler call failed.
    #[error("target '{target}': {source}")]
    Target {
        target: String,
        #[source]
        source: TargetError,
    },

    /// The client's driver/target tables are inconsistent.
    #[error("invalid client configuration: {0}")]
    InvalidClient(String),

    /// A thread panicked while holding the registry lock.
    #[error("registry lock poisoned")]
    LockPoisoned,

    /// Several independent per-target failures from one call.
    #[error("{0}")]
    Aggregate(ErrorMap),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Per-target failures collected from a single Review, Audit, AddData or
/// RemoveData call. Keys are target names.
#[derive(Debug, Default)]
pub struct ErrorMap {
    errors: BTreeMap<String, Vec<ClientError>>,
}

impl ErrorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error under `target`. Earlier errors for the same target are kept.
    pub fn insert(&mut self, target: impl Into<String>, error: ClientError) {
        self.errors.entry(target.into()).or_default().push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of targets with at least one error.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn get(&self, target: &str) -> Option<&[ClientError]> {
        self.errors.get(target).map(Vec::as_slice)
    }

    pub fn contains(&self, target: &str) -> bool {
        self.errors.contains_key(target)
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.errors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ClientError])> {
        self.errors
            .iter()
            .map(|(target, errors)| (target.as_str(), errors.as_slice()))
    }
}

impl fmt::Display for ErrorMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (target, errors) in &self.errors {
            for error in errors {
                if !first {
                    f.write_str("\n")?;
                }
                write!(f, "{}: {}", target, error)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ErrorMap {}
