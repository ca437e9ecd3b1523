// review.rs — Shaping admission requests and raw objects into reviews.
//
// Accepted inputs:
//   - an AdmissionReview (`kind: AdmissionReview`, `request: {...}`)
//   - a bare AdmissionRequest (its `kind` is a group/version/kind object)
//   - a raw Kubernetes object (`apiVersion` + string `kind`), as audit and
//     offline evaluation submit them
// Anything else is not claimed by this target.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::K8sError;

pub const ADMISSION_REVIEW_KIND: &str = "AdmissionReview";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

impl GroupVersionKind {
    /// Split an `apiVersion` such as "apps/v1" or "v1".
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }
}

/// Side information attached to a review by the target, not by the caller's
/// request. Currently the namespace object of namespaced reviews.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unstable {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub namespace: Value,
}

impl Unstable {
    fn is_empty(&self) -> bool {
        self.namespace.is_null()
    }
}

/// The review payload handed to drivers and matchers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GkReview {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default)]
    pub kind: GroupVersionKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub object: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub old_object: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub user_info: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(rename = "_unstable", default, skip_serializing_if = "Unstable::is_empty")]
    pub unstable: Unstable,
}

impl GkReview {
    /// Shape `input` into a review. `Ok(None)` when the input is neither a
    /// Kubernetes object nor an admission request.
    pub fn from_input(input: &Value) -> Result<Option<Self>, K8sError> {
        let Some(map) = input.as_object() else {
            return Ok(None);
        };
        match map.get("kind") {
            Some(Value::String(kind)) if kind == ADMISSION_REVIEW_KIND => {
                let request = map.get("request").filter(|r| r.is_object()).ok_or_else(|| {
                    K8sError::MalformedObject("AdmissionReview has no request".to_string())
                })?;
                Self::from_request(request).map(Some)
            }
            Some(Value::Object(_)) => Self::from_request(input).map(Some),
            Some(Value::String(_)) if map.get("apiVersion").is_some_and(Value::is_string) => {
                Self::from_object(input).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn from_request(request: &Value) -> Result<Self, K8sError> {
        let mut review: GkReview = serde_json::from_value(request.clone())
            .map_err(|e| K8sError::MalformedObject(format!("invalid admission request: {}", e)))?;
        if review.kind.kind.is_empty() {
            return Err(K8sError::MalformedObject(
                "admission request has no kind".to_string(),
            ));
        }
        if review.object.is_null() && review.old_object.is_null() {
            return Err(K8sError::MalformedObject(
                "admission request carries neither object nor oldObject".to_string(),
            ));
        }
        // Requests for objects created with generateName have no name yet.
        if review.name.is_empty() {
            review.name = metadata_str(review.subject(), "name").to_string();
        }
        // The caller's side information is never trusted.
        review.unstable = Unstable::default();
        Ok(review)
    }

    fn from_object(object: &Value) -> Result<Self, K8sError> {
        let api_version = object
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let kind = object.get("kind").and_then(Value::as_str).unwrap_or_default();
        if kind.is_empty() {
            return Err(K8sError::MalformedObject("object has an empty kind".to_string()));
        }
        Ok(Self {
            kind: GroupVersionKind::from_api_version(api_version, kind),
            name: metadata_str(object, "name").to_string(),
            namespace: metadata_str(object, "namespace").to_string(),
            object: object.clone(),
            ..Self::default()
        })
    }

    pub fn from_value(review: &Value) -> Result<Self, K8sError> {
        serde_json::from_value(review.clone())
            .map_err(|e| K8sError::MalformedObject(format!("invalid review: {}", e)))
    }

    pub fn to_value(&self) -> Result<Value, K8sError> {
        serde_json::to_value(self)
            .map_err(|e| K8sError::MalformedObject(format!("unserializable review: {}", e)))
    }

    /// The object being reviewed; the old object for deletes.
    pub fn subject(&self) -> &Value {
        if self.object.is_null() {
            &self.old_object
        } else {
            &self.object
        }
    }

    pub fn is_namespace(&self) -> bool {
        self.kind.group.is_empty() && self.kind.kind == "Namespace"
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        labels_of(self.subject())
    }
}

fn metadata_str<'a>(object: &'a Value, field: &str) -> &'a str {
    object
        .get("metadata")
        .and_then(|m| m.get(field))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// `metadata.labels` of an object; non-string values are skipped.
pub fn labels_of(object: &Value) -> BTreeMap<String, String> {
    object
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
