// template.rs — ConstraintTemplate resource and metadata validation.
//
// A ConstraintTemplate declares a new constraint Kind: its parameter schema
// and, per target, the policy source code for one or more engines. The
// template name must equal the lowercased Kind so that constraints can find
// their template from their own Kind.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClientError, Result};

pub const TEMPLATES_API_VERSION: &str = "templates.gatekeeper.sh/v1";
pub const TEMPLATE_KIND: &str = "ConstraintTemplate";

/// Engine name that the legacy `rego`/`libs` target fields map onto.
pub const REGO_ENGINE: &str = "Rego";

/// Names become constraint CRD names and must fit a DNS label.
pub const MAX_NAME_LEN: usize = 63;

/// Object metadata shared by templates and constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintTemplate {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: TemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    #[serde(default)]
    pub crd: Crd,
    #[serde(default)]
    pub targets: Vec<TemplateTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Crd {
    #[serde(default)]
    pub spec: CrdSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdSpec {
    #[serde(default)]
    pub names: Names,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Names {
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
}

/// Parameter schema for the constraints of this template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    #[serde(
        rename = "openAPIV3Schema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub open_api_v3_schema: Option<Value>,
    /// Legacy templates accept parameters the schema does not describe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_schema: Option<bool>,
}

/// Policy source for one target domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateTarget {
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rego: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code: Vec<Code>,
}

/// Source code for a single engine. The shape of `source` is engine specific.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Code {
    pub engine: String,
    #[serde(default)]
    pub source: Value,
}

fn default_api_version() -> String {
    TEMPLATES_API_VERSION.to_string()
}

fn default_kind() -> String {
    TEMPLATE_KIND.to_string()
}

impl ConstraintTemplate {
    /// An empty template for `kind`, named after the lowercased Kind.
    pub fn new(kind: &str) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: kind.to_lowercase(),
                ..ObjectMeta::default()
            },
            spec: TemplateSpec {
                crd: Crd {
                    spec: CrdSpec {
                        names: Names {
                            kind: kind.to_string(),
                            short_names: Vec::new(),
                        },
                        validation: None,
                    },
                },
                targets: Vec::new(),
            },
        }
    }

    /// Add a target with a single engine's source code.
    pub fn with_target(mut self, target: &str, engine: &str, source: Value) -> Self {
        self.spec.targets.push(TemplateTarget {
            target: target.to_string(),
            code: vec![Code {
                engine: engine.to_string(),
                source,
            }],
            ..TemplateTarget::default()
        });
        self
    }

    pub fn with_parameter_schema(mut self, schema: Value) -> Self {
        self.spec.crd.spec.validation = Some(Validation {
            open_api_v3_schema: Some(schema),
            legacy_schema: None,
        });
        self
    }

    pub fn from_yaml(manifest: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(manifest)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The constraint Kind this template declares.
    pub fn constraint_kind(&self) -> &str {
        &self.spec.crd.spec.names.kind
    }

    pub fn target_names(&self) -> Vec<&str> {
        self.spec.targets.iter().map(|t| t.target.as_str()).collect()
    }

    /// Engines declared by the (single) target, in declaration order.
    pub fn engines(&self) -> Vec<String> {
        self.spec
            .targets
            .first()
            .map(|t| t.effective_code().into_iter().map(|c| c.engine).collect())
            .unwrap_or_default()
    }

    /// Source code declared for `engine`, legacy Rego included.
    pub fn code_for(&self, engine: &str) -> Option<Code> {
        self.spec
            .targets
            .first()?
            .effective_code()
            .into_iter()
            .find(|c| c.engine == engine)
    }

    pub fn parameter_schema(&self) -> Option<&Value> {
        self.spec
            .crd
            .spec
            .validation
            .as_ref()
            .and_then(|v| v.open_api_v3_schema.as_ref())
    }

    pub fn is_legacy_schema(&self) -> bool {
        self.spec
            .crd
            .spec
            .validation
            .as_ref()
            .and_then(|v| v.legacy_schema)
            .unwrap_or(false)
    }

    /// Two templates are semantically equal when name and spec agree;
    /// bookkeeping such as labels and annotations is ignored.
    pub fn semantic_eq(&self, other: &ConstraintTemplate) -> bool {
        self.metadata.name == other.metadata.name && self.spec == other.spec
    }

    /// Check name/Kind agreement, target count and engine uniqueness.
    /// Returns the single declared target.
    pub fn validate_metadata(&self) -> Result<&TemplateTarget> {
        let name = self.name();
        if name.is_empty() {
            return Err(ClientError::InvalidConstraintTemplate(
                "template has no name".to_string(),
            ));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ClientError::InvalidConstraintTemplate(format!(
                "template name '{}' is longer than {} characters",
                name, MAX_NAME_LEN
            )));
        }
        let kind = self.constraint_kind();
        if kind.is_empty() {
            return Err(ClientError::InvalidConstraintTemplate(format!(
                "template '{}' does not declare spec.crd.spec.names.kind",
                name
            )));
        }
        if name != kind.to_lowercase() {
            return Err(ClientError::InvalidConstraintTemplate(format!(
                "template name '{}' must equal the lowercase of its kind '{}'",
                name, kind
            )));
        }

        let target = match self.spec.targets.as_slice() {
            [target] => target,
            [] => {
                return Err(ClientError::InvalidConstraintTemplate(format!(
                    "template '{}' declares no targets",
                    name
                )))
            }
            targets => {
                return Err(ClientError::InvalidConstraintTemplate(format!(
                    "template '{}' declares {} targets; exactly one is required",
                    name,
                    targets.len()
                )))
            }
        };
        if target.target.is_empty() {
            return Err(ClientError::InvalidConstraintTemplate(format!(
                "template '{}' has a target with no name",
                name
            )));
        }

        let mut seen = BTreeSet::new();
        for code in &target.code {
            if code.engine.is_empty() {
                return Err(ClientError::InvalidConstraintTemplate(format!(
                    "template '{}' has code with no engine",
                    name
                )));
            }
            if !seen.insert(code.engine.as_str()) {
                return Err(ClientError::InvalidConstraintTemplate(format!(
                    "template '{}' declares engine '{}' more than once",
                    name, code.engine
                )));
            }
        }
        Ok(target)
    }
}

impl TemplateTarget {
    /// Declared code plus the legacy `rego` field, which counts as Rego code
    /// unless the target already declares Rego explicitly.
    pub fn effective_code(&self) -> Vec<Code> {
        let mut code = self.code.clone();
        if !self.rego.is_empty() && !code.iter().any(|c| c.engine == REGO_ENGINE) {
            code.push(Code {
                engine: REGO_ENGINE.to_string(),
                source: serde_json::json!({ "rego": self.rego, "libs": self.libs }),
            });
        }
        code
    }
}
