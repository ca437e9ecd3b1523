// schema.rs — Constraint schema generation, validation and defaulting.
//
// Every template compiles to a structural schema describing its constraints:
// the fixed constraint envelope (metadata, match, enforcement settings) with
// the template's parameter schema and the target's match schema plugged in.
// The same schema validates incoming constraints and supplies their defaults.
//
// Supported keywords are the structural subset of OpenAPI v3 used by
// Kubernetes CRDs: type, nullable, enum, properties, required, items,
// additionalProperties, minItems/maxItems, minLength/maxLength,
// minimum/maximum, pattern, default, x-kubernetes-preserve-unknown-fields and
// x-kubernetes-int-or-string.

use std::fmt;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::constraint::Constraint;
use crate::error::{ClientError, Result};
use crate::target::TargetHandler;
use crate::template::{ConstraintTemplate, MAX_NAME_LEN};

pub const PRESERVE_UNKNOWN_FIELDS: &str = "x-kubernetes-preserve-unknown-fields";
pub const INT_OR_STRING: &str = "x-kubernetes-int-or-string";

const TYPES: &[&str] = &["object", "array", "string", "integer", "number", "boolean"];

/// A validation failure at a JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "<root>: {}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

fn join<T: fmt::Display>(errors: &[T]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Generate the constraint schema for `template` served by `handler`, and
/// check that it is structural.
pub fn generate(template: &ConstraintTemplate, handler: &dyn TargetHandler) -> Result<Value> {
    let schema = json!({
        "type": "object",
        "properties": {
            "apiVersion": { "type": "string" },
            "kind": { "type": "string" },
            "metadata": {
                "type": "object",
                "properties": {
                    "name": { "type": "string", "maxLength": MAX_NAME_LEN },
                    "labels": {
                        "type": "object",
                        "additionalProperties": { "type": "string" }
                    },
                    "annotations": {
                        "type": "object",
                        "additionalProperties": { "type": "string" }
                    }
                }
            },
            "spec": {
                "type": "object",
                "properties": {
                    "match": handler.match_schema(),
                    "enforcementAction": { "type": "string" },
                    "scopedEnforcementActions": scoped_actions_schema(),
                    "parameters": parameter_schema(template)
                }
            },
            "status": {
                "type": "object",
                PRESERVE_UNKNOWN_FIELDS: true
            }
        }
    });

    validate_structural(&schema).map_err(|errors| {
        ClientError::InvalidConstraintTemplate(format!(
            "template '{}' does not produce a structural schema: {}",
            template.name(),
            join(&errors)
        ))
    })?;
    Ok(schema)
}

fn scoped_actions_schema() -> Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "required": ["action", "enforcementPoints"],
            "properties": {
                "action": { "type": "string" },
                "enforcementPoints": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name"],
                        "properties": { "name": { "type": "string" } }
                    }
                }
            }
        }
    })
}

/// The template's parameter schema, or an open object when none is given.
/// Legacy templates additionally keep unknown parameters.
fn parameter_schema(template: &ConstraintTemplate) -> Value {
    let mut schema = match template.parameter_schema() {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(other) => other.clone(),
        None => return json!({ "type": "object", PRESERVE_UNKNOWN_FIELDS: true }),
    };
    if let Value::Object(map) = &mut schema {
        if !map.contains_key("type") && map.contains_key("properties") {
            map.insert("type".to_string(), json!("object"));
        }
        if template.is_legacy_schema() {
            map.insert(PRESERVE_UNKNOWN_FIELDS.to_string(), json!(true));
        }
    }
    schema
}

fn flag(node: &Map<String, Value>, key: &str) -> bool {
    node.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn child_path(path: &str, name: &str) -> String {
    if name.is_empty() {
        path.to_string()
    } else if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

/// Check that `schema` is structural: every node is typed (unless it
/// preserves unknown fields or is int-or-string), arrays declare a single
/// item schema, `properties` only appear on objects, and defaults validate.
pub fn validate_structural(schema: &Value) -> std::result::Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();
    check_structural(schema, "", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_structural(node: &Value, path: &str, errors: &mut Vec<FieldError>) {
    let mut fail = |field: &str, message: String| {
        errors.push(FieldError {
            path: child_path(path, field),
            message,
        })
    };

    let Some(obj) = node.as_object() else {
        fail("", "schema must be an object".to_string());
        return;
    };
    if obj.contains_key("$ref") {
        fail("$ref", "references are not supported".to_string());
    }

    let untyped_ok = flag(obj, PRESERVE_UNKNOWN_FIELDS) || flag(obj, INT_OR_STRING);
    let ty = obj.get("type").and_then(Value::as_str);
    match obj.get("type") {
        None if !untyped_ok => fail("type", "must not be empty for specified fields".to_string()),
        None => {}
        Some(Value::String(t)) if TYPES.contains(&t.as_str()) => {}
        Some(other) => fail("type", format!("unsupported value {}", other)),
    }

    if let Some(pattern) = obj.get("pattern") {
        match pattern.as_str().map(Regex::new) {
            Some(Ok(_)) => {}
            Some(Err(e)) => fail("pattern", format!("invalid regular expression: {}", e)),
            None => fail("pattern", "must be a string".to_string()),
        }
    }

    if let Some(required) = obj.get("required") {
        let all_strings = required
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string));
        if !all_strings {
            fail("required", "must be a list of property names".to_string());
        }
    }

    // Child checks push into `errors` directly, so release `fail` first.
    let mut nested = Vec::new();

    if let Some(properties) = obj.get("properties") {
        match properties.as_object() {
            Some(properties) => {
                if ty != Some("object") {
                    nested.push(FieldError {
                        path: child_path(path, "properties"),
                        message: "only allowed for type object".to_string(),
                    });
                }
                for (name, child) in properties {
                    check_structural(
                        child,
                        &child_path(path, &format!("properties[{}]", name)),
                        &mut nested,
                    );
                }
            }
            None => nested.push(FieldError {
                path: child_path(path, "properties"),
                message: "must be a map of schemas".to_string(),
            }),
        }
    }

    if let Some(additional) = obj.get("additionalProperties") {
        if obj.contains_key("properties") {
            nested.push(FieldError {
                path: child_path(path, "additionalProperties"),
                message: "additionalProperties and properties are mutually exclusive".to_string(),
            });
        }
        match additional {
            Value::Bool(_) => {}
            Value::Object(_) => {
                check_structural(additional, &child_path(path, "additionalProperties"), &mut nested)
            }
            _ => nested.push(FieldError {
                path: child_path(path, "additionalProperties"),
                message: "must be a boolean or a schema".to_string(),
            }),
        }
    }

    match (ty, obj.get("items")) {
        (Some("array"), None) => nested.push(FieldError {
            path: child_path(path, "items"),
            message: "must be specified for type array".to_string(),
        }),
        (_, Some(items)) => {
            if ty != Some("array") {
                nested.push(FieldError {
                    path: child_path(path, "items"),
                    message: "only allowed for type array".to_string(),
                });
            }
            if items.is_array() {
                nested.push(FieldError {
                    path: child_path(path, "items"),
                    message: "must be a single schema, not a list".to_string(),
                });
            } else {
                check_structural(items, &child_path(path, "items"), &mut nested);
            }
        }
        _ => {}
    }

    if let Some(default) = obj.get("default") {
        if let Err(default_errors) = validate(node, default) {
            for e in default_errors {
                nested.push(FieldError {
                    path: child_path(&child_path(path, "default"), &e.path),
                    message: e.message,
                });
            }
        }
    }

    errors.extend(nested);
}

/// Validate `value` against `schema`, collecting every failure.
pub fn validate(schema: &Value, value: &Value) -> std::result::Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();
    validate_node(schema, value, "", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn has_type(value: &Value, ty: &str) -> bool {
    match ty {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        _ => false,
    }
}

fn validate_node(schema: &Value, value: &Value, path: &str, errors: &mut Vec<FieldError>) {
    let Some(s) = schema.as_object() else {
        return;
    };
    let mut fail = |message: String| {
        errors.push(FieldError {
            path: path.to_string(),
            message,
        })
    };

    if value.is_null() {
        if !flag(s, "nullable") && s.contains_key("type") {
            fail("must not be null".to_string());
        }
        return;
    }

    if flag(s, INT_OR_STRING) {
        if !(value.is_string() || value.is_i64() || value.is_u64()) {
            fail(format!(
                "must be an integer or a string, got {}",
                type_name(value)
            ));
            return;
        }
    } else if let Some(ty) = s.get("type").and_then(Value::as_str) {
        if !has_type(value, ty) {
            fail(format!("must be of type {}, got {}", ty, type_name(value)));
            return;
        }
    }

    if let Some(Value::Array(allowed)) = s.get("enum") {
        if !allowed.contains(value) {
            fail(format!("unsupported value {}", value));
        }
    }

    if let Some(text) = value.as_str() {
        let len = text.chars().count() as u64;
        if let Some(min) = s.get("minLength").and_then(Value::as_u64) {
            if len < min {
                fail(format!("must be at least {} characters long", min));
            }
        }
        if let Some(max) = s.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                fail(format!("may not be longer than {} characters", max));
            }
        }
        if let Some(Ok(re)) = s.get("pattern").and_then(Value::as_str).map(Regex::new) {
            if !re.is_match(text) {
                fail(format!("must match pattern '{}'", re.as_str()));
            }
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = s.get("minimum").and_then(Value::as_f64) {
            if n < min {
                fail(format!("must be greater than or equal to {}", min));
            }
        }
        if let Some(max) = s.get("maximum").and_then(Value::as_f64) {
            if n > max {
                fail(format!("must be less than or equal to {}", max));
            }
        }
    }

    if let Some(items) = value.as_array() {
        let len = items.len() as u64;
        if let Some(min) = s.get("minItems").and_then(Value::as_u64) {
            if len < min {
                fail(format!("must have at least {} items", min));
            }
        }
        if let Some(max) = s.get("maxItems").and_then(Value::as_u64) {
            if len > max {
                fail(format!("must have at most {} items", max));
            }
        }
        if let Some(item_schema) = s.get("items") {
            for (i, item) in items.iter().enumerate() {
                validate_node(item_schema, item, &format!("{}[{}]", path, i), errors);
            }
        }
    }

    if let Some(map) = value.as_object() {
        if let Some(Value::Array(required)) = s.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(name) {
                    errors.push(FieldError {
                        path: child_path(path, name),
                        message: "required value".to_string(),
                    });
                }
            }
        }
        let properties = s.get("properties").and_then(Value::as_object);
        for (key, child) in map {
            let child_schema = properties.and_then(|p| p.get(key));
            match (child_schema, s.get("additionalProperties")) {
                (Some(child_schema), _) => {
                    validate_node(child_schema, child, &child_path(path, key), errors)
                }
                (None, Some(Value::Object(_))) => validate_node(
                    &s["additionalProperties"],
                    child,
                    &child_path(path, key),
                    errors,
                ),
                (None, Some(Value::Bool(false))) => errors.push(FieldError {
                    path: child_path(path, key),
                    message: "field not declared in schema".to_string(),
                }),
                // Undeclared fields are pruned by the API server, not rejected.
                (None, _) => {}
            }
        }
    }
}

/// Fill in `default` values for properties missing from objects that are
/// present in `value`. Absent parent objects are not created.
pub fn apply_defaults(schema: &Value, value: &mut Value) {
    match value {
        Value::Object(map) => {
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (name, property) in properties {
                    if !map.contains_key(name) {
                        if let Some(default) = property.get("default") {
                            map.insert(name.clone(), default.clone());
                        }
                    }
                    if let Some(child) = map.get_mut(name) {
                        apply_defaults(property, child);
                    }
                }
            } else if let Some(additional) = schema
                .get("additionalProperties")
                .filter(|a| a.is_object())
            {
                for child in map.values_mut() {
                    apply_defaults(additional, child);
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for item in items {
                    apply_defaults(item_schema, item);
                }
            }
        }
        _ => {}
    }
}

/// `constraint` with schema defaults applied.
pub fn defaulted(schema: &Value, constraint: &Constraint) -> Result<Constraint> {
    let invalid = |e: serde_json::Error| {
        ClientError::InvalidConstraint(format!("{}: {}", constraint, e))
    };
    let mut value = serde_json::to_value(constraint).map_err(invalid)?;
    apply_defaults(schema, &mut value);
    serde_json::from_value(value).map_err(invalid)
}

/// Validate `constraint` against its template's generated schema.
pub fn validate_constraint(schema: &Value, constraint: &Constraint) -> Result<()> {
    let value = serde_json::to_value(constraint)
        .map_err(|e| ClientError::InvalidConstraint(format!("{}: {}", constraint, e)))?;
    validate(schema, &value).map_err(|errors| {
        ClientError::InvalidConstraint(format!("{}: {}", constraint, join(&errors)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::StoragePath;
    use crate::error::TargetError;
    use crate::result::ViolationResult;
    use crate::target::{Matcher, TargetResult};

    struct StubTarget;

    impl TargetHandler for StubTarget {
        fn name(&self) -> &str {
            "stub"
        }
        fn match_schema(&self) -> Value {
            json!({ "type": "object", "properties": { "name": { "type": "string" } } })
        }
        fn process_data(&self, _: &Value) -> TargetResult<Option<(StoragePath, Value)>> {
            Ok(None)
        }
        fn handle_review(&self, _: &Value) -> TargetResult<Option<Value>> {
            Ok(None)
        }
        fn handle_violation(&self, _: &mut ViolationResult) -> TargetResult<()> {
            Ok(())
        }
        fn validate_constraint(&self, _: &Constraint) -> TargetResult<()> {
            Ok(())
        }
        fn to_matcher(&self, _: &Constraint) -> TargetResult<Box<dyn Matcher>> {
            Err(TargetError::Match("unused".to_string()))
        }
        fn library(&self) -> &str {
            ""
        }
    }

    fn template(params: Value) -> ConstraintTemplate {
        ConstraintTemplate::new("Foo")
            .with_target("stub", "e", json!(null))
            .with_parameter_schema(params)
    }

    #[test]
    fn generated_schema_embeds_parameters_and_match() {
        let schema = generate(
            &template(json!({
                "type": "object",
                "properties": { "labels": { "type": "array", "items": { "type": "string" } } }
            })),
            &StubTarget,
        )
        .unwrap();
        let spec = &schema["properties"]["spec"]["properties"];
        assert_eq!(spec["parameters"]["properties"]["labels"]["type"], "array");
        assert_eq!(spec["match"]["properties"]["name"]["type"], "string");
    }

    #[test]
    fn missing_parameter_schema_preserves_unknown_fields() {
        let schema = generate(&ConstraintTemplate::new("Foo"), &StubTarget).unwrap();
        let params = &schema["properties"]["spec"]["properties"]["parameters"];
        assert_eq!(params[PRESERVE_UNKNOWN_FIELDS], true);

        let constraint = Constraint::new("Foo", "x").with_parameters(json!({"anything": [1, 2]}));
        assert!(validate_constraint(&schema, &constraint).is_ok());
    }

    #[test]
    fn non_structural_parameters_rejected() {
        let untyped = template(json!({
            "type": "object",
            "properties": { "labels": { "items": { "type": "string" } } }
        }));
        match generate(&untyped, &StubTarget) {
            Err(ClientError::InvalidConstraintTemplate(msg)) => {
                assert!(msg.contains("properties[labels]"), "{}", msg)
            }
            other => panic!("expected InvalidConstraintTemplate, got {:?}", other),
        }

        let list_items = template(json!({
            "type": "array",
            "items": [{ "type": "string" }]
        }));
        assert!(generate(&list_items, &StubTarget).is_err());

        let bad_default = template(json!({
            "type": "object",
            "properties": { "count": { "type": "integer", "default": "three" } }
        }));
        assert!(generate(&bad_default, &StubTarget).is_err());
    }

    #[test]
    fn validation_reports_paths() {
        let schema = json!({
            "type": "object",
            "required": ["labels"],
            "properties": {
                "labels": { "type": "array", "maxItems": 2, "items": { "type": "string", "pattern": "^[a-z]+$" } },
                "mode": { "type": "string", "enum": ["strict", "lax"] },
                "ratio": { "type": "number", "minimum": 0, "maximum": 1 }
            }
        });

        assert!(validate(&schema, &json!({ "labels": ["a"], "mode": "lax", "ratio": 0.5 })).is_ok());

        let errors = validate(
            &schema,
            &json!({ "labels": ["ok", "Bad", 3], "mode": "other", "ratio": 2 }),
        )
        .unwrap_err();
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"labels"));
        assert!(paths.contains(&"labels[1]"));
        assert!(paths.contains(&"labels[2]"));
        assert!(paths.contains(&"mode"));
        assert!(paths.contains(&"ratio"));

        let missing = validate(&schema, &json!({})).unwrap_err();
        assert_eq!(missing[0].path, "labels");
    }

    #[test]
    fn int_or_string_and_nullable() {
        let schema = json!({
            "type": "object",
            "properties": {
                "port": { INT_OR_STRING: true },
                "note": { "type": "string", "nullable": true }
            }
        });
        assert!(validate(&schema, &json!({ "port": 80, "note": null })).is_ok());
        assert!(validate(&schema, &json!({ "port": "http" })).is_ok());
        assert!(validate(&schema, &json!({ "port": 1.5 })).is_err());
    }

    #[test]
    fn defaults_fill_present_objects_only() {
        let schema = json!({
            "type": "object",
            "properties": {
                "spec": {
                    "type": "object",
                    "properties": {
                        "parameters": {
                            "type": "object",
                            "properties": {
                                "message": { "type": "string", "default": "missing label" },
                                "labels": { "type": "array", "items": { "type": "string" } }
                            }
                        }
                    }
                }
            }
        });

        let with_params = Constraint::new("Foo", "x").with_parameters(json!({ "labels": ["a"] }));
        let defaulted_constraint = defaulted(&schema, &with_params).unwrap();
        assert_eq!(defaulted_constraint.parameters()["message"], "missing label");
        assert_eq!(defaulted_constraint.parameters()["labels"], json!(["a"]));

        let without_params = Constraint::new("Foo", "y");
        assert_eq!(defaulted(&schema, &without_params).unwrap(), without_params);
    }
}
