// matcher.rs — `spec.match` for Kubernetes admission constraints.
//
// A review matches when every criterion present in the block matches:
//   kinds              any entry whose apiGroups and kinds both match
//   scope              "*", "Cluster" or "Namespaced"
//   name               glob on the object name
//   namespaces         glob list; the object's namespace must match one
//   excludedNamespaces glob list; the object's namespace must match none
//   labelSelector      on the object's labels
//   namespaceSelector  on the labels of the object's namespace
// For a Namespace object "its namespace" is the object itself. Namespace
// criteria do not apply to other cluster-scoped objects.

use std::collections::{BTreeMap, BTreeSet};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use gk_constraint::{Constraint, Matcher, TargetResult};

use crate::error::K8sError;
use crate::review::{labels_of, GkReview};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    #[serde(default)]
    pub kinds: Vec<KindSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub excluded_namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An empty list matches everything, as does "*".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindSelector {
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub kinds: Vec<String>,
}

impl KindSelector {
    fn matches(&self, group: &str, kind: &str) -> bool {
        list_matches(&self.api_groups, group) && list_matches(&self.kinds, kind)
    }
}

fn list_matches(list: &[String], value: &str) -> bool {
    list.is_empty() || list.iter().any(|v| v == "*" || v == value)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone)]
struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self.operator {
            Operator::In => labels.get(&self.key).is_some_and(|v| self.values.contains(v)),
            Operator::NotIn => !labels.get(&self.key).is_some_and(|v| self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

/// A compiled label selector. All requirements must hold.
#[derive(Debug, Clone)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    pub fn compile(selector: &LabelSelector) -> Result<Self, K8sError> {
        let mut requirements: Vec<Requirement> = selector
            .match_labels
            .iter()
            .map(|(key, value)| Requirement {
                key: key.clone(),
                operator: Operator::In,
                values: BTreeSet::from([value.clone()]),
            })
            .collect();

        for expr in &selector.match_expressions {
            if expr.key.is_empty() {
                return Err(K8sError::InvalidSelector(
                    "matchExpressions entry has an empty key".to_string(),
                ));
            }
            let operator = match expr.operator.as_str() {
                "In" => Operator::In,
                "NotIn" => Operator::NotIn,
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                other => {
                    return Err(K8sError::InvalidSelector(format!(
                        "unknown operator '{}' for key '{}'",
                        other, expr.key
                    )))
                }
            };
            let needs_values = matches!(operator, Operator::In | Operator::NotIn);
            if needs_values == expr.values.is_empty() {
                return Err(K8sError::InvalidSelector(format!(
                    "operator '{}' for key '{}' {}",
                    expr.operator,
                    expr.key,
                    if needs_values {
                        "requires values"
                    } else {
                        "takes no values"
                    }
                )));
            }
            requirements.push(Requirement {
                key: expr.key.clone(),
                operator,
                values: expr.values.iter().cloned().collect(),
            });
        }
        Ok(Self { requirements })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    All,
    Cluster,
    Namespaced,
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>, K8sError> {
    patterns.iter().map(|p| compile_pattern(p)).collect()
}

fn compile_pattern(pattern: &str) -> Result<Pattern, K8sError> {
    Pattern::new(pattern).map_err(|e| K8sError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.msg.to_string(),
    })
}

impl Match {
    /// Decode the constraint's `spec.match`; a missing block matches all.
    pub fn from_constraint(constraint: &Constraint) -> Result<Self, K8sError> {
        match &constraint.spec.match_criteria {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(criteria) => serde_json::from_value(criteria.clone())
                .map_err(|e| K8sError::InvalidMatch(e.to_string())),
        }
    }

    pub fn compile(&self) -> Result<MatchCriteria, K8sError> {
        let scope = match self.scope.as_deref() {
            None | Some("*") => Scope::All,
            Some("Cluster") => Scope::Cluster,
            Some("Namespaced") => Scope::Namespaced,
            Some(other) => {
                return Err(K8sError::InvalidMatch(format!(
                    "scope must be one of '*', 'Cluster', 'Namespaced'; got '{}'",
                    other
                )))
            }
        };
        Ok(MatchCriteria {
            kinds: self.kinds.clone(),
            scope,
            namespaces: compile_patterns(&self.namespaces)?,
            excluded_namespaces: compile_patterns(&self.excluded_namespaces)?,
            name: self.name.as_deref().map(compile_pattern).transpose()?,
            labels: self.label_selector.as_ref().map(Selector::compile).transpose()?,
            namespace_labels: self
                .namespace_selector
                .as_ref()
                .map(Selector::compile)
                .transpose()?,
        })
    }
}

/// Compiled `spec.match` of one constraint.
#[derive(Debug, Clone)]
pub struct MatchCriteria {
    kinds: Vec<KindSelector>,
    scope: Scope,
    namespaces: Vec<Pattern>,
    excluded_namespaces: Vec<Pattern>,
    name: Option<Pattern>,
    labels: Option<Selector>,
    namespace_labels: Option<Selector>,
}

impl MatchCriteria {
    pub fn matches_review(&self, review: &GkReview) -> Result<bool, K8sError> {
        if !self.kinds.is_empty()
            && !self
                .kinds
                .iter()
                .any(|k| k.matches(&review.kind.group, &review.kind.kind))
        {
            return Ok(false);
        }

        let namespaced = !review.namespace.is_empty();
        match self.scope {
            Scope::Cluster if namespaced => return Ok(false),
            Scope::Namespaced if !namespaced => return Ok(false),
            _ => {}
        }

        if let Some(pattern) = &self.name {
            if !pattern.matches(&review.name) {
                return Ok(false);
            }
        }
        if let Some(selector) = &self.labels {
            if !selector.matches(&review.labels()) {
                return Ok(false);
            }
        }

        let namespace = if review.is_namespace() {
            review.name.as_str()
        } else if namespaced {
            review.namespace.as_str()
        } else {
            return Ok(true);
        };

        if !self.namespaces.is_empty() && !self.namespaces.iter().any(|p| p.matches(namespace)) {
            return Ok(false);
        }
        if self.excluded_namespaces.iter().any(|p| p.matches(namespace)) {
            return Ok(false);
        }
        if let Some(selector) = &self.namespace_labels {
            let labels = if review.is_namespace() {
                review.labels()
            } else if !review.unstable.namespace.is_null() {
                labels_of(&review.unstable.namespace)
            } else {
                return Err(K8sError::NamespaceNotCached(namespace.to_string()));
            };
            if !selector.matches(&labels) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Matcher for MatchCriteria {
    fn matches(&self, review: &Value) -> TargetResult<bool> {
        let review = GkReview::from_value(review)?;
        Ok(self.matches_review(&review)?)
    }
}

fn selector_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "matchLabels": {
                "type": "object",
                "additionalProperties": { "type": "string" }
            },
            "matchExpressions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["key", "operator"],
                    "properties": {
                        "key": { "type": "string" },
                        "operator": {
                            "type": "string",
                            "enum": ["In", "NotIn", "Exists", "DoesNotExist"]
                        },
                        "values": { "type": "array", "items": { "type": "string" } }
                    }
                }
            }
        }
    })
}

/// Schema of `spec.match` for constraints of this target.
pub fn match_schema() -> Value {
    let strings = json!({ "type": "array", "items": { "type": "string" } });
    json!({
        "type": "object",
        "properties": {
            "kinds": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "apiGroups": strings.clone(),
                        "kinds": strings.clone()
                    }
                }
            },
            "scope": { "type": "string", "enum": ["*", "Cluster", "Namespaced"] },
            "namespaces": strings.clone(),
            "excludedNamespaces": strings,
            "labelSelector": selector_schema(),
            "namespaceSelector": selector_schema(),
            "name": { "type": "string" }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gk_constraint::schema;

    fn review(kind: &str, name: &str, namespace: &str, labels: Value) -> GkReview {
        GkReview::from_input(&json!({
            "apiVersion": "v1",
            "kind": kind,
            "metadata": { "name": name, "namespace": namespace, "labels": labels }
        }))
        .unwrap()
        .unwrap()
    }

    fn criteria(block: Value) -> MatchCriteria {
        let m: Match = serde_json::from_value(block).unwrap();
        m.compile().unwrap()
    }

    fn with_namespace(mut review: GkReview, labels: Value) -> GkReview {
        review.unstable.namespace = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": review.namespace, "labels": labels }
        });
        review
    }

    #[test]
    fn empty_match_matches_everything() {
        let m = criteria(json!({}));
        assert!(m.matches_review(&review("Pod", "a", "web", json!({}))).unwrap());
        assert!(m.matches_review(&review("Node", "n1", "", json!({}))).unwrap());
    }

    #[test]
    fn kinds_and_scope() {
        let m = criteria(json!({
            "kinds": [{ "apiGroups": [""], "kinds": ["Pod"] }],
            "scope": "Namespaced"
        }));
        assert!(m.matches_review(&review("Pod", "a", "web", json!({}))).unwrap());
        assert!(!m.matches_review(&review("Service", "a", "web", json!({}))).unwrap());
        assert!(!m.matches_review(&review("Pod", "a", "", json!({}))).unwrap());

        let wildcard = criteria(json!({ "kinds": [{ "apiGroups": ["*"], "kinds": ["*"] }], "scope": "Cluster" }));
        assert!(wildcard.matches_review(&review("Node", "n1", "", json!({}))).unwrap());
        assert!(!wildcard.matches_review(&review("Pod", "a", "web", json!({}))).unwrap());
    }

    #[test]
    fn namespace_globs() {
        let m = criteria(json!({
            "namespaces": ["prod-*", "web"],
            "excludedNamespaces": ["prod-legacy"]
        }));
        assert!(m.matches_review(&review("Pod", "a", "prod-eu", json!({}))).unwrap());
        assert!(m.matches_review(&review("Pod", "a", "web", json!({}))).unwrap());
        assert!(!m.matches_review(&review("Pod", "a", "prod-legacy", json!({}))).unwrap());
        assert!(!m.matches_review(&review("Pod", "a", "dev", json!({}))).unwrap());
        // A Namespace is matched by its own name; other cluster-scoped
        // objects ignore namespace criteria.
        assert!(m.matches_review(&review("Namespace", "prod-us", "", json!({}))).unwrap());
        assert!(!m.matches_review(&review("Namespace", "dev", "", json!({}))).unwrap());
        assert!(m.matches_review(&review("Node", "n1", "", json!({}))).unwrap());
    }

    #[test]
    fn name_glob() {
        let m = criteria(json!({ "name": "nginx-*" }));
        assert!(m.matches_review(&review("Pod", "nginx-1", "web", json!({}))).unwrap());
        assert!(!m.matches_review(&review("Pod", "redis", "web", json!({}))).unwrap());
    }

    #[test]
    fn label_selector() {
        let m = criteria(json!({
            "labelSelector": {
                "matchLabels": { "app": "nginx" },
                "matchExpressions": [
                    { "key": "tier", "operator": "In", "values": ["frontend", "edge"] },
                    { "key": "legacy", "operator": "DoesNotExist" }
                ]
            }
        }));
        let ok = review("Pod", "a", "web", json!({ "app": "nginx", "tier": "edge" }));
        assert!(m.matches_review(&ok).unwrap());
        let legacy = review("Pod", "a", "web", json!({ "app": "nginx", "tier": "edge", "legacy": "y" }));
        assert!(!m.matches_review(&legacy).unwrap());
        let other = review("Pod", "a", "web", json!({ "app": "redis", "tier": "edge" }));
        assert!(!m.matches_review(&other).unwrap());
    }

    #[test]
    fn namespace_selector_needs_namespace_labels() {
        let m = criteria(json!({ "namespaceSelector": { "matchLabels": { "env": "prod" } } }));
        let bare = review("Pod", "a", "web", json!({}));
        assert!(matches!(
            m.matches_review(&bare),
            Err(K8sError::NamespaceNotCached(ns)) if ns == "web"
        ));

        let prod = with_namespace(bare.clone(), json!({ "env": "prod" }));
        assert!(m.matches_review(&prod).unwrap());
        let dev = with_namespace(bare, json!({ "env": "dev" }));
        assert!(!m.matches_review(&dev).unwrap());

        let ns = review("Namespace", "web", "", json!({ "env": "prod" }));
        assert!(m.matches_review(&ns).unwrap());
    }

    #[test]
    fn invalid_criteria_fail_to_compile() {
        let bad_operator: Match = serde_json::from_value(json!({
            "labelSelector": { "matchExpressions": [{ "key": "a", "operator": "Near" }] }
        }))
        .unwrap();
        assert!(matches!(bad_operator.compile(), Err(K8sError::InvalidSelector(_))));

        let missing_values: Match = serde_json::from_value(json!({
            "namespaceSelector": { "matchExpressions": [{ "key": "a", "operator": "In" }] }
        }))
        .unwrap();
        assert!(matches!(missing_values.compile(), Err(K8sError::InvalidSelector(_))));

        let bad_glob = Match {
            namespaces: vec!["prod-[".to_string()],
            ..Match::default()
        };
        assert!(matches!(bad_glob.compile(), Err(K8sError::InvalidPattern { .. })));

        let bad_scope = Match {
            scope: Some("Galaxy".to_string()),
            ..Match::default()
        };
        assert!(matches!(bad_scope.compile(), Err(K8sError::InvalidMatch(_))));
    }

    #[test]
    fn schema_is_structural() {
        assert!(schema::validate_structural(&match_schema()).is_ok());
        let block = json!({
            "kinds": [{ "apiGroups": ["apps"], "kinds": ["Deployment"] }],
            "excludedNamespaces": ["kube-*"],
            "labelSelector": { "matchExpressions": [{ "key": "a", "operator": "Exists" }] }
        });
        assert!(schema::validate(&match_schema(), &block).is_ok());
        assert!(schema::validate(&match_schema(), &json!({ "scope": "Galaxy" })).is_err());
    }
}
