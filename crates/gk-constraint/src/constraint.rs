// constraint.rs — Constraint resources and their enforcement settings.
//
// A constraint is an instance of a template's Kind. Besides parameters and
// target-specific match criteria it carries an enforcement action, which may
// be "scoped": a list of (action, enforcement points) pairs that decides which
// evaluation surfaces the constraint participates in.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClientError, Result};
use crate::template::ObjectMeta;

/// API group every constraint must belong to.
pub const CONSTRAINTS_GROUP: &str = "constraints.gatekeeper.sh";
pub const CONSTRAINTS_API_VERSION: &str = "constraints.gatekeeper.sh/v1beta1";

/// Matches every enforcement point.
pub const ALL_ENFORCEMENT_POINTS: &str = "*";
/// The admission webhook's enforcement point.
pub const WEBHOOK_ENFORCEMENT_POINT: &str = "validation.gatekeeper.sh";
/// The audit controller's enforcement point.
pub const AUDIT_ENFORCEMENT_POINT: &str = "audit.gatekeeper.sh";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ConstraintSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintSpec {
    /// Target-specific match criteria.
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_criteria: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforcement_action: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scoped_enforcement_actions: Vec<ScopedEnforcementAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopedEnforcementAction {
    pub action: String,
    #[serde(default)]
    pub enforcement_points: Vec<EnforcementPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementPoint {
    pub name: String,
}

fn default_api_version() -> String {
    CONSTRAINTS_API_VERSION.to_string()
}

impl Constraint {
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            api_version: default_api_version(),
            kind: kind.to_string(),
            metadata: ObjectMeta {
                name: name.to_string(),
                ..ObjectMeta::default()
            },
            spec: ConstraintSpec::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.spec.parameters = Some(parameters);
        self
    }

    pub fn with_match(mut self, criteria: Value) -> Self {
        self.spec.match_criteria = Some(criteria);
        self
    }

    pub fn with_enforcement_action(mut self, action: &str) -> Self {
        self.spec.enforcement_action = Some(action.to_string());
        self
    }

    /// Add a scoped action and switch the constraint to `scoped` enforcement.
    pub fn with_scoped_action(mut self, action: &str, points: &[&str]) -> Self {
        self.spec.enforcement_action = Some(EnforcementAction::Scoped.to_string());
        self.spec
            .scoped_enforcement_actions
            .push(ScopedEnforcementAction {
                action: action.to_string(),
                enforcement_points: points
                    .iter()
                    .map(|p| EnforcementPoint {
                        name: p.to_string(),
                    })
                    .collect(),
            });
        self
    }

    pub fn from_yaml(manifest: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(manifest)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The API group part of `apiVersion` (everything before the last '/').
    pub fn group(&self) -> &str {
        match self.api_version.rsplit_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    /// Name of the owning template: the lowercased Kind.
    pub fn template_name(&self) -> String {
        self.kind.to_lowercase()
    }

    pub fn parameters(&self) -> &Value {
        static NULL: Value = Value::Null;
        self.spec.parameters.as_ref().unwrap_or(&NULL)
    }

    /// Constraints are semantically equal when identity and spec agree.
    pub fn semantic_eq(&self, other: &Constraint) -> bool {
        self.api_version == other.api_version
            && self.kind == other.kind
            && self.metadata.name == other.metadata.name
            && self.spec == other.spec
    }

    /// Name, group and Kind checks that precede any template lookup.
    pub fn validate_metadata(&self) -> Result<()> {
        if self.metadata.name.is_empty() {
            return Err(ClientError::InvalidConstraint(format!(
                "{} constraint has no name",
                self.kind
            )));
        }
        if self.group() != CONSTRAINTS_GROUP {
            return Err(ClientError::InvalidConstraint(format!(
                "constraint '{}' has group '{}'; want '{}'",
                self.metadata.name,
                self.group(),
                CONSTRAINTS_GROUP
            )));
        }
        if self.kind.is_empty() {
            return Err(ClientError::InvalidConstraint(format!(
                "constraint '{}' has no kind",
                self.metadata.name
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.metadata.name)
    }
}

/// Top-level enforcement action of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementAction {
    Deny,
    Dryrun,
    Warn,
    /// Actions are given per enforcement point in `scopedEnforcementActions`.
    Scoped,
}

impl EnforcementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementAction::Deny => "deny",
            EnforcementAction::Dryrun => "dryrun",
            EnforcementAction::Warn => "warn",
            EnforcementAction::Scoped => "scoped",
        }
    }
}

impl fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnforcementAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "deny" => Ok(EnforcementAction::Deny),
            "dryrun" => Ok(EnforcementAction::Dryrun),
            "warn" => Ok(EnforcementAction::Warn),
            "scoped" => Ok(EnforcementAction::Scoped),
            other => Err(format!("unrecognized enforcement action '{}'", other)),
        }
    }
}

/// Effective enforcement settings of a stored constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct EnforcementSettings {
    pub action: EnforcementAction,
    /// Enforcement point → actions. Only populated for scoped constraints.
    pub point_actions: BTreeMap<String, BTreeSet<String>>,
}

impl EnforcementSettings {
    /// Read and validate the enforcement settings of `constraint`.
    /// A missing action means `deny`.
    pub fn from_constraint(constraint: &Constraint) -> Result<Self> {
        let invalid = |msg: String| ClientError::InvalidConstraint(format!("{}: {}", constraint, msg));

        let action = match constraint.spec.enforcement_action.as_deref() {
            None | Some("") => EnforcementAction::Deny,
            Some(raw) => raw.parse::<EnforcementAction>().map_err(invalid)?,
        };

        let mut point_actions: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        if action != EnforcementAction::Scoped {
            if !constraint.spec.scoped_enforcement_actions.is_empty() {
                return Err(invalid(format!(
                    "scopedEnforcementActions requires enforcementAction 'scoped', got '{}'",
                    action
                )));
            }
            return Ok(Self {
                action,
                point_actions,
            });
        }

        if constraint.spec.scoped_enforcement_actions.is_empty() {
            return Err(invalid(
                "enforcementAction 'scoped' requires at least one scopedEnforcementActions entry"
                    .to_string(),
            ));
        }
        for scoped in &constraint.spec.scoped_enforcement_actions {
            match scoped.action.parse::<EnforcementAction>() {
                Ok(EnforcementAction::Scoped) | Err(_) => {
                    return Err(invalid(format!(
                        "invalid scoped enforcement action '{}'",
                        scoped.action
                    )))
                }
                Ok(_) => {}
            }
            if scoped.enforcement_points.is_empty() {
                return Err(invalid(format!(
                    "scoped action '{}' names no enforcement points",
                    scoped.action
                )));
            }
            for point in &scoped.enforcement_points {
                if point.name.is_empty() {
                    return Err(invalid("enforcement point with empty name".to_string()));
                }
                point_actions
                    .entry(point.name.clone())
                    .or_default()
                    .insert(scoped.action.clone());
            }
        }
        Ok(Self {
            action,
            point_actions,
        })
    }

    /// Whether the constraint takes part in a query restricted to `points`.
    /// An empty slice means every point.
    pub fn applies_to(&self, points: &[String]) -> bool {
        if self.action != EnforcementAction::Scoped {
            return true;
        }
        if points.is_empty() || points.iter().any(|p| p == ALL_ENFORCEMENT_POINTS) {
            return !self.point_actions.is_empty();
        }
        self.point_actions.contains_key(ALL_ENFORCEMENT_POINTS)
            || points.iter().any(|p| self.point_actions.contains_key(p))
    }

    /// Sorted, de-duplicated actions that apply at `points`. Empty for
    /// non-scoped constraints.
    pub fn scoped_actions_for(&self, points: &[String]) -> Vec<String> {
        let every_point = points.is_empty() || points.iter().any(|p| p == ALL_ENFORCEMENT_POINTS);
        let mut actions = BTreeSet::new();
        for (point, point_actions) in &self.point_actions {
            if every_point || point == ALL_ENFORCEMENT_POINTS || points.contains(point) {
                actions.extend(point_actions.iter().cloned());
            }
        }
        actions.into_iter().collect()
    }

    /// Enforcement points named by this constraint, `*` excluded.
    pub fn named_points(&self) -> impl Iterator<Item = &str> {
        self.point_actions
            .keys()
            .map(String::as_str)
            .filter(|p| *p != ALL_ENFORCEMENT_POINTS)
    }
}
