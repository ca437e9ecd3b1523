// error.rs — Error types for the Kubernetes admission target.

use gk_constraint::TargetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum K8sError {
    /// The input looks like a Kubernetes object or admission request but
    /// lacks required fields.
    #[error("{0}")]
    MalformedObject(String),

    /// `spec.match` could not be decoded.
    #[error("invalid match criteria: {0}")]
    InvalidMatch(String),

    /// A namespace or name pattern is not a valid glob.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A label selector requirement is malformed.
    #[error("invalid label selector: {0}")]
    InvalidSelector(String),

    /// A namespaceSelector needs labels of a namespace nobody has synced.
    #[error("namespace '{0}' is not cached")]
    NamespaceNotCached(String),
}

impl From<K8sError> for TargetError {
    fn from(e: K8sError) -> Self {
        match e {
            K8sError::MalformedObject(msg) => TargetError::Malformed(msg),
            K8sError::NamespaceNotCached(_) => TargetError::Match(e.to_string()),
            other => TargetError::InvalidConstraint(other.to_string()),
        }
    }
}
