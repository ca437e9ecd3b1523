// handler.rs — The Kubernetes admission target.

use serde_json::Value;

use gk_constraint::{
    Constraint, DataCache, Matcher, StoragePath, TargetError, TargetHandler, TargetResult,
    ViolationResult,
};

use crate::cache::NamespaceCache;
use crate::error::K8sError;
use crate::matcher::{match_schema, Match};
use crate::review::GkReview;

pub const TARGET_NAME: &str = "admission.k8s.gatekeeper.sh";

/// Rego boilerplate exposing reviews, constraints and synced objects to
/// policies written for this target. The match rules follow `MatchCriteria`.
const LIBRARY: &str = r#"package target

matching_constraints[constraint] {
	constraint := data.constraints[_][_]
	matches_criteria(constraint_match(constraint), input.review)
}

matching_reviews_and_constraints[[review, constraint]] {
	obj := inventory_object[_]
	review := make_review(obj)
	constraint := data.constraints[_][_]
	matches_criteria(constraint_match(constraint), review)
}

inventory_object[obj] {
	obj := data.inventory.cluster[_][_][_]
}

inventory_object[obj] {
	obj := data.inventory.namespace[_][_][_][_]
}

make_review(obj) = review {
	review := {
		"kind": object_gvk(obj),
		"name": obj.metadata.name,
		"namespace": object.get(obj.metadata, "namespace", ""),
		"object": obj,
		"_unstable": {"namespace": cached_namespace(obj)},
	}
}

object_gvk(obj) = {"group": parts[0], "version": parts[1], "kind": obj.kind} {
	parts := split(obj.apiVersion, "/")
	count(parts) == 2
}

object_gvk(obj) = {"group": "", "version": obj.apiVersion, "kind": obj.kind} {
	not contains(obj.apiVersion, "/")
}

cached_namespace(obj) = object.get(namespaces, object.get(obj.metadata, "namespace", ""), null) {
	cluster := object.get(data.inventory, "cluster", {})
	namespaces := object.get(object.get(cluster, "v1", {}), "Namespace", {})
}

constraint_match(constraint) = object.get(object.get(constraint, "spec", {}), "match", {})

has_field(obj, field) {
	_ = obj[field]
}

matches_criteria(match, review) {
	matches_kinds(match, review)
	matches_scope(match, review)
	matches_name(match, review)
	matches_label_selector(match, review)
	matches_namespaces(match, review)
	not excluded_namespace(match, review)
	matches_namespace_selector(match, review)
}

matches_kinds(match, review) {
	count(object.get(match, "kinds", [])) == 0
}

matches_kinds(match, review) {
	selector := match.kinds[_]
	any_or_wildcard(object.get(selector, "apiGroups", []), review.kind.group)
	any_or_wildcard(object.get(selector, "kinds", []), review.kind.kind)
}

any_or_wildcard(list, value) {
	count(list) == 0
}

any_or_wildcard(list, value) {
	list[_] == "*"
}

any_or_wildcard(list, value) {
	list[_] == value
}

matches_scope(match, review) {
	object.get(match, "scope", "*") == "*"
}

matches_scope(match, review) {
	match.scope == "Cluster"
	review.namespace == ""
}

matches_scope(match, review) {
	match.scope == "Namespaced"
	review.namespace != ""
}

matches_name(match, review) {
	not has_field(match, "name")
}

matches_name(match, review) {
	glob.match(match.name, [], review.name)
}

matches_label_selector(match, review) {
	not has_field(match, "labelSelector")
}

matches_label_selector(match, review) {
	selector_matches(match.labelSelector, object_labels(review.object))
}

# The namespace that namespace criteria apply to. Undefined for
# cluster-scoped objects other than Namespaces.
criteria_namespace(review) = review.name {
	review.kind.kind == "Namespace"
}

criteria_namespace(review) = review.namespace {
	review.kind.kind != "Namespace"
	review.namespace != ""
}

matches_namespaces(match, review) {
	count(object.get(match, "namespaces", [])) == 0
}

matches_namespaces(match, review) {
	not criteria_namespace(review)
}

matches_namespaces(match, review) {
	glob.match(match.namespaces[_], [], criteria_namespace(review))
}

excluded_namespace(match, review) {
	glob.match(match.excludedNamespaces[_], [], criteria_namespace(review))
}

matches_namespace_selector(match, review) {
	not has_field(match, "namespaceSelector")
}

matches_namespace_selector(match, review) {
	not criteria_namespace(review)
}

matches_namespace_selector(match, review) {
	review.kind.kind == "Namespace"
	selector_matches(match.namespaceSelector, object_labels(review.object))
}

matches_namespace_selector(match, review) {
	review.kind.kind != "Namespace"
	namespace := review._unstable.namespace
	namespace != null
	selector_matches(match.namespaceSelector, object_labels(namespace))
}

object_labels(obj) = object.get(object.get(obj, "metadata", {}), "labels", {})

selector_matches(selector, labels) {
	not label_mismatch(object.get(selector, "matchLabels", {}), labels)
	not failed_expression(object.get(selector, "matchExpressions", []), labels)
}

label_mismatch(required, labels) {
	value := required[key]
	object.get(labels, key, null) != value
}

failed_expression(expressions, labels) {
	expression := expressions[_]
	not expression_holds(expression, labels)
}

expression_holds(expression, labels) {
	expression.operator == "In"
	labels[expression.key] == expression.values[_]
}

expression_holds(expression, labels) {
	expression.operator == "NotIn"
	not value_listed(expression.values, labels[expression.key])
}

expression_holds(expression, labels) {
	expression.operator == "Exists"
	has_field(labels, expression.key)
}

expression_holds(expression, labels) {
	expression.operator == "DoesNotExist"
	not has_field(labels, expression.key)
}

value_listed(values, value) {
	values[_] == value
}
"#;

#[derive(Debug, Default)]
pub struct K8sValidationTarget {
    namespaces: NamespaceCache,
}

impl K8sValidationTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespaces(&self) -> &NamespaceCache {
        &self.namespaces
    }
}

fn required_str<'a>(object: &'a Value, pointer: &str) -> Result<&'a str, K8sError> {
    object
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| K8sError::MalformedObject(format!("object has no {}", pointer)))
}

impl TargetHandler for K8sValidationTarget {
    fn name(&self) -> &str {
        TARGET_NAME
    }

    fn match_schema(&self) -> Value {
        match_schema()
    }

    /// Keys: `["cluster", apiVersion, kind, name]` for cluster-scoped objects,
    /// `["namespace", namespace, apiVersion, kind, name]` otherwise.
    fn process_data(&self, object: &Value) -> TargetResult<Option<(StoragePath, Value)>> {
        if !object.is_object() {
            return Ok(None);
        }
        let api_version = required_str(object, "/apiVersion")?;
        let kind = required_str(object, "/kind")?;
        let name = required_str(object, "/metadata/name")?;
        let namespace = object
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut key = if namespace.is_empty() {
            vec!["cluster".to_string()]
        } else {
            vec!["namespace".to_string(), namespace.to_string()]
        };
        key.extend([api_version.to_string(), kind.to_string(), name.to_string()]);
        Ok(Some((key, object.clone())))
    }

    fn handle_review(&self, object: &Value) -> TargetResult<Option<Value>> {
        let Some(mut review) = GkReview::from_input(object)? else {
            tracing::debug!("input is not a Kubernetes object; not claimed");
            return Ok(None);
        };
        if !review.namespace.is_empty() {
            if let Some(namespace) = self.namespaces.get(&review.namespace) {
                review.unstable.namespace = namespace;
            }
        }
        Ok(Some(review.to_value()?))
    }

    /// Sets `resource` to the reviewed object (the old object for deletes).
    fn handle_violation(&self, result: &mut ViolationResult) -> TargetResult<()> {
        let Some(review) = &result.review else {
            return Ok(());
        };
        let resource = ["object", "oldObject"]
            .iter()
            .filter_map(|field| review.get(*field))
            .find(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| TargetError::Malformed("review has no object".to_string()))?;
        result.resource = Some(resource);
        Ok(())
    }

    fn validate_constraint(&self, constraint: &Constraint) -> TargetResult<()> {
        Match::from_constraint(constraint)?.compile()?;
        Ok(())
    }

    fn to_matcher(&self, constraint: &Constraint) -> TargetResult<Box<dyn Matcher>> {
        let criteria = Match::from_constraint(constraint)?.compile()?;
        Ok(Box::new(criteria))
    }

    fn library(&self) -> &str {
        LIBRARY
    }

    fn cache(&self) -> Option<&dyn DataCache> {
        Some(&self.namespaces)
    }
}
