//! Kubernetes admission target for the gk-constraint engine
//!
//! Shapes AdmissionReviews, admission requests and raw objects into review
//! payloads, evaluates constraint `spec.match` blocks against them, keys
//! synced objects for referential policies, and keeps a namespace cache so
//! namespace selectors can be evaluated offline.

pub mod cache;
pub mod error;
pub mod handler;
pub mod matcher;
pub mod review;

pub use cache::NamespaceCache;
pub use error::K8sError;
pub use handler::{K8sValidationTarget, TARGET_NAME};
pub use matcher::{LabelSelector, Match, MatchCriteria};
pub use review::{GkReview, GroupVersionKind};
