//! Constraint compilation and evaluation engine
//!
//! Turns declarative ConstraintTemplates into schema-validated constraint
//! types, keeps the live constraints for each type, routes compiled policy
//! code to pluggable evaluation backends ([`Driver`]), and answers Review
//! (single object) and Audit (whole state) queries with deterministic,
//! partially-recoverable results.
//!
//! Target domains plug in through [`TargetHandler`]; the Kubernetes
//! admission target lives in the `gk-target-k8s` crate.

pub mod client;
pub mod config;
pub mod constraint;
pub mod context;
pub mod driver;
pub mod error;
#[cfg(any(test, feature = "fakes"))]
pub mod fakes;
pub mod query;
mod registry;
pub mod result;
pub mod schema;
pub mod target;
pub mod template;

pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ConfigError};
pub use constraint::{
    Constraint, EnforcementAction, EnforcementSettings, ALL_ENFORCEMENT_POINTS,
    AUDIT_ENFORCEMENT_POINT, CONSTRAINTS_GROUP, WEBHOOK_ENFORCEMENT_POINT,
};
pub use context::Context;
pub use driver::{Driver, DriverResult, QueryResponse, StoragePath};
pub use error::{ClientError, DriverError, ErrorMap, Result, TargetError};
pub use result::{QueryOpts, Response, Responses, Stat, StatsEntry, ViolationResult};
pub use target::{DataCache, Matcher, TargetHandler, TargetResult};
pub use template::{ConstraintTemplate, REGO_ENGINE};
