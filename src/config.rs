//! Configuration management for Tollgate.
//!
//! Configuration is layered: an optional YAML file first, then environment
//! variables prefixed with `TOLLGATE_` (`__` separates nested keys, e.g.
//! `TOLLGATE_RATE_LIMITING__STORAGE_TARGET`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{MemoryBackendConfig, RuleSpec};

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Master switch; when off every request is allowed
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Where bucket state lives: `memory://` or a Redis URL
    #[serde(default = "default_storage_target")]
    pub storage_target: String,

    /// Named rules, normalized when the limiter is built
    #[serde(default)]
    pub rules: HashMap<String, RuleSpec>,

    /// In-memory backend limits
    #[serde(default)]
    pub memory: MemoryBackendConfig,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            storage_target: default_storage_target(),
            rules: HashMap::new(),
            memory: MemoryBackendConfig::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_storage_target() -> String {
    "memory://".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut loaded: Self = config.try_deserialize()?;

        // The config crate lowercases every key; rule names are case-sensitive.
        if let Some(path) = path {
            let names = rule_names_from_file(path)?;
            loaded.rate_limiting.rules = restore_rule_names(loaded.rate_limiting.rules, &names);
        }

        Ok(loaded)
    }

    /// Load configuration from a YAML file, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }
}

#[derive(Default, Deserialize)]
struct RuleNamesFile {
    #[serde(default)]
    rate_limiting: RuleNamesSection,
}

#[derive(Default, Deserialize)]
struct RuleNamesSection {
    #[serde(default)]
    rules: HashMap<String, serde_yaml::Value>,
}

/// Rule names exactly as written in the file, keyed by their lowercase form.
fn rule_names_from_file(path: &Path) -> Result<HashMap<String, String>> {
    let contents = std::fs::read_to_string(path)?;
    let file: Option<RuleNamesFile> =
        serde_yaml::from_str(&contents).map_err(|e| TollgateError::Config(e.to_string()))?;

    let mut names = HashMap::new();
    for name in file.unwrap_or_default().rate_limiting.rules.into_keys() {
        let folded = name.to_lowercase();
        if let Some(existing) = names.get(&folded) {
            return Err(TollgateError::Config(format!(
                "rule names {:?} and {:?} differ only by case",
                existing, name
            )));
        }
        names.insert(folded, name);
    }
    Ok(names)
}

/// Rename lowercased rules back to their spelling in the file. Rules that only
/// come from the environment keep the lowercase name.
fn restore_rule_names(
    rules: HashMap<String, RuleSpec>,
    names: &HashMap<String, String>,
) -> HashMap<String, RuleSpec> {
    rules
        .into_iter()
        .map(|(name, spec)| match names.get(&name) {
            Some(original) => (original.clone(), spec),
            None => (name, spec),
        })
        .collect()
}
