//! Client configuration structures

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constraint::{AUDIT_ENFORCEMENT_POINT, WEBHOOK_ENFORCEMENT_POINT};

/// Errors loading a client configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid client config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Engine configuration, typically read from a TOML file:
///
/// ```toml
/// driver_priority = ["K8sNativeValidation", "Rego"]
/// enforcement_points = ["validation.gatekeeper.sh", "audit.gatekeeper.sh"]
/// ignore_no_referential_driver = false
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Driver names in preference order. When a template declares code for
    /// several engines, the first listed driver wins. Registered drivers not
    /// listed here rank after the listed ones, in registration order.
    #[serde(default)]
    pub driver_priority: Vec<String>,

    /// Enforcement points this deployment evaluates. Scoped constraints that
    /// name other points are accepted but logged.
    #[serde(default = "default_enforcement_points")]
    pub enforcement_points: Vec<String>,

    /// Accept referential data when no driver can store it (logged instead
    /// of failing with `NoReferentialDriver`).
    #[serde(default)]
    pub ignore_no_referential_driver: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            driver_priority: Vec::new(),
            enforcement_points: default_enforcement_points(),
            ignore_no_referential_driver: false,
        }
    }
}

fn default_enforcement_points() -> Vec<String> {
    vec![
        WEBHOOK_ENFORCEMENT_POINT.to_string(),
        AUDIT_ENFORCEMENT_POINT.to_string(),
    ]
}

impl ClientConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load client config from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Try to load config, returning default if the file is missing or invalid
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Self::default()
            }
            Err(e) => {
                tracing::warn!("using default client config: {}", e);
                Self::default()
            }
        }
    }
}
