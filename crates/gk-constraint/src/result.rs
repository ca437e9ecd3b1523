// result.rs — Query options, violation results and per-target responses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constraint::Constraint;
use crate::error::{ClientError, ErrorMap, Result};

/// Options for Review and Audit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOpts {
    /// Enforcement points to evaluate. Empty means every point.
    pub enforcement_points: Vec<String>,
    /// Ask drivers for an evaluation trace.
    pub tracing_enabled: bool,
    /// Ask drivers for evaluation statistics.
    pub stats_enabled: bool,
}

impl QueryOpts {
    pub fn enforcement_point(mut self, point: &str) -> Self {
        self.enforcement_points.push(point.to_string());
        self
    }

    pub fn with_tracing(mut self) -> Self {
        self.tracing_enabled = true;
        self
    }

    pub fn with_stats(mut self) -> Self {
        self.stats_enabled = true;
        self
    }
}

/// One violation (or auto-rejection) produced for a constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationResult {
    pub target: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    pub constraint: Constraint,
    pub enforcement_action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scoped_enforcement_actions: Vec<String>,
    /// The object under review, filled in by the target handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    /// Review payload the result was produced from; handed to the target's
    /// `handle_violation` and never serialized.
    #[serde(skip)]
    pub review: Option<Value>,
}

impl ViolationResult {
    /// A bare result as a driver would produce it. The engine fills in
    /// target, enforcement and review details afterwards.
    pub fn new(constraint: &Constraint, msg: impl Into<String>) -> Self {
        Self {
            target: String::new(),
            msg: msg.into(),
            metadata: Map::new(),
            constraint: constraint.clone(),
            enforcement_action: String::new(),
            scoped_enforcement_actions: Vec::new(),
            resource: None,
            review: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stat {
    pub name: String,
    pub value: Value,
    /// Which component produced the stat (e.g. the engine name).
    pub source: String,
}

/// A group of statistics about one evaluated entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsEntry {
    /// What kind of entity the stats describe (e.g. "template").
    pub scope: String,
    /// The entity itself (e.g. a template Kind).
    pub stats_for: String,
    pub stats: Vec<Stat>,
}

/// Results of one query against one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub target: String,
    pub results: Vec<ViolationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats: Vec<StatsEntry>,
}

impl Response {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            ..Self::default()
        }
    }

    /// Stable sort by constraint Kind, constraint name, then message, so that
    /// identical inputs always produce identical output.
    pub fn sort(&mut self) {
        self.results.sort_by(|a, b| {
            (
                a.constraint.kind.as_str(),
                a.constraint.metadata.name.as_str(),
                a.msg.as_str(),
            )
                .cmp(&(
                    b.constraint.kind.as_str(),
                    b.constraint.metadata.name.as_str(),
                    b.msg.as_str(),
                ))
        });
    }
}

/// Outcome of any client call: which targets handled it, their responses,
/// and the per-target errors that did not abort the call.
#[derive(Debug, Default)]
pub struct Responses {
    pub by_target: BTreeMap<String, Response>,
    pub handled: BTreeMap<String, bool>,
    pub errors: ErrorMap,
}

impl Responses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `target` as having handled the request.
    pub fn handle(&mut self, target: &str) {
        self.handled.insert(target.to_string(), true);
    }

    pub fn handled_for(&self, target: &str) -> bool {
        self.handled.get(target).copied().unwrap_or(false)
    }

    /// Every result, in target order.
    pub fn results(&self) -> Vec<&ViolationResult> {
        self.by_target
            .values()
            .flat_map(|r| r.results.iter())
            .collect()
    }

    /// Human-readable concatenation of the per-target traces.
    pub fn trace_dump(&self) -> String {
        let mut out = String::new();
        for (target, response) in &self.by_target {
            out.push_str(&format!("Target: {}\n", target));
            match &response.trace {
                Some(trace) => {
                    out.push_str(trace);
                    if !trace.ends_with('\n') {
                        out.push('\n');
                    }
                }
                None => out.push_str("Trace: TRACING DISABLED\n"),
            }
            out.push('\n');
        }
        out
    }

    /// Turn collected per-target errors into an `Aggregate` error. Callers
    /// that want partial results should read `by_target` before calling this.
    pub fn into_result(self) -> Result<Responses> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(ClientError::Aggregate(self.errors))
        }
    }
}
