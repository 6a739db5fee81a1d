//! Typed configuration for consumer wiring.
//!
//! Two loading mechanisms, mirroring how modules read their sections:
//!
//! 1. **Lenient loading** (default): falls back to `T::default()` when the section is missing.
//!    - Used by `section_or_default` and `ConsumersConfig::load`
//! 2. **Strict loading**: requires the section to be present and valid.
//!    - Used by `section_required`
//!
//! A section looks like `consumers = { config: { ... } }`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::definition::EndpointSettings;
use crate::hub::ServiceHub;
use crate::naming::{DefaultEndpointNameFormatter, EndpointNameFormatter, NameFormatting};

/// Section name read by [`ConsumersConfig::load`].
pub const CONSUMERS_SECTION: &str = "consumers";

/// Configuration error for typed config operations
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("section '{section}' not found")]
    SectionNotFound { section: String },
    #[error("section '{section}' must be an object")]
    InvalidSectionStructure { section: String },
    #[error("missing 'config' key in section '{section}'")]
    MissingConfigKey { section: String },
    #[error("invalid config in section '{section}': {source}")]
    InvalidConfig {
        section: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Provider of raw JSON configuration sections.
pub trait ConfigProvider: Send + Sync {
    /// Returns the raw JSON section, if any.
    fn get_section(&self, name: &str) -> Option<&serde_json::Value>;
}

/// [`ConfigProvider`] over a single JSON object whose keys are section names.
#[derive(Debug, Clone, Default)]
pub struct JsonConfigProvider {
    root: serde_json::Map<String, serde_json::Value>,
}

impl JsonConfigProvider {
    /// Non-object roots yield an empty provider.
    #[must_use]
    pub fn new(root: serde_json::Value) -> Self {
        match root {
            serde_json::Value::Object(root) => Self { root },
            _ => Self::default(),
        }
    }
}

impl ConfigProvider for JsonConfigProvider {
    fn get_section(&self, name: &str) -> Option<&serde_json::Value> {
        self.root.get(name)
    }
}

fn parse_config<T: DeserializeOwned>(
    section: &str,
    value: &serde_json::Value,
) -> Result<T, ConfigError> {
    serde_json::from_value(value.clone()).map_err(|e| ConfigError::InvalidConfig {
        section: section.to_owned(),
        source: e,
    })
}

/// Lenient configuration loader that falls back to defaults.
///
/// - section absent, not an object, or without a `config` key → `Ok(T::default())`
/// - `config` present but invalid → `Err(ConfigError::InvalidConfig)`
///
/// # Errors
/// Returns `ConfigError::InvalidConfig` if the config exists but cannot be deserialized.
pub fn section_or_default<T: DeserializeOwned + Default>(
    provider: &dyn ConfigProvider,
    section: &str,
) -> Result<T, ConfigError> {
    let Some(raw) = provider.get_section(section) else {
        return Ok(T::default());
    };
    let Some(obj) = raw.as_object() else {
        return Ok(T::default());
    };
    let Some(config) = obj.get("config") else {
        return Ok(T::default());
    };
    parse_config(section, config)
}

/// Strict configuration loader that requires the section to be present.
///
/// # Errors
/// Returns `ConfigError` if the section is not found, has invalid structure, or the config is
/// invalid.
pub fn section_required<T: DeserializeOwned>(
    provider: &dyn ConfigProvider,
    section: &str,
) -> Result<T, ConfigError> {
    let raw = provider
        .get_section(section)
        .ok_or_else(|| ConfigError::SectionNotFound {
            section: section.to_owned(),
        })?;

    let obj = raw
        .as_object()
        .ok_or_else(|| ConfigError::InvalidSectionStructure {
            section: section.to_owned(),
        })?;

    let config = obj
        .get("config")
        .ok_or_else(|| ConfigError::MissingConfigKey {
            section: section.to_owned(),
        })?;

    parse_config(section, config)
}

/// Application-wide consumer wiring settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumersConfig {
    /// Casing of generated endpoint names.
    pub name_formatting: NameFormatting,
    /// Prepended to every generated endpoint name.
    pub endpoint_prefix: Option<String>,
    /// Settings for endpoints created by the bulk pass when a definition leaves them unset.
    pub endpoint_defaults: EndpointSettings,
}

impl ConsumersConfig {
    /// Load the `consumers` section leniently.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidConfig` if the section is present but malformed.
    pub fn load(provider: &dyn ConfigProvider) -> Result<Self, ConfigError> {
        section_or_default(provider, CONSUMERS_SECTION)
    }

    #[must_use]
    pub fn endpoint_name_formatter(&self) -> DefaultEndpointNameFormatter {
        DefaultEndpointNameFormatter::new(self.name_formatting, self.endpoint_prefix.clone())
    }

    /// Register the configured endpoint name formatter in `hub`.
    pub fn install(&self, hub: &ServiceHub) {
        let formatter: Arc<dyn EndpointNameFormatter> = Arc::new(self.endpoint_name_formatter());
        hub.register::<dyn EndpointNameFormatter>(formatter);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize, Default)]
    struct TestConfig {
        #[serde(default)]
        retries: u32,
        #[serde(default)]
        enabled: bool,
    }

    fn provider() -> JsonConfigProvider {
        JsonConfigProvider::new(json!({
            "valid": { "config": { "retries": 3, "enabled": true } },
            "no_config": { "other": 1 },
            "not_object": "oops",
            "broken": { "config": { "retries": "three" } },
        }))
    }

    #[test]
    fn lenient_success() {
        let cfg: TestConfig = section_or_default(&provider(), "valid").unwrap();
        assert_eq!(
            cfg,
            TestConfig {
                retries: 3,
                enabled: true
            }
        );
    }

    #[test]
    fn lenient_falls_back_to_default() {
        let p = provider();
        for section in ["missing", "no_config", "not_object"] {
            let cfg: TestConfig = section_or_default(&p, section).unwrap();
            assert_eq!(cfg, TestConfig::default(), "section {section}");
        }
    }

    #[test]
    fn lenient_rejects_invalid_config() {
        let err = section_or_default::<TestConfig>(&provider(), "broken").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig { .. }));
    }

    #[test]
    fn strict_reports_each_failure() {
        let p = provider();
        assert!(matches!(
            section_required::<TestConfig>(&p, "missing"),
            Err(ConfigError::SectionNotFound { .. })
        ));
        assert!(matches!(
            section_required::<TestConfig>(&p, "not_object"),
            Err(ConfigError::InvalidSectionStructure { .. })
        ));
        assert!(matches!(
            section_required::<TestConfig>(&p, "no_config"),
            Err(ConfigError::MissingConfigKey { .. })
        ));
        assert!(section_required::<TestConfig>(&p, "valid").is_ok());
    }

    #[test]
    fn consumers_config_loads_and_installs_formatter() {
        let p = JsonConfigProvider::new(json!({
            "consumers": { "config": {
                "name_formatting": "kebab-case",
                "endpoint_prefix": "prod-",
                "endpoint_defaults": { "prefetch_count": 32 }
            }}
        }));
        let cfg = ConsumersConfig::load(&p).unwrap();
        assert_eq!(cfg.name_formatting, NameFormatting::KebabCase);
        assert_eq!(cfg.endpoint_defaults.prefetch_count, Some(32));

        let hub = ServiceHub::new();
        cfg.install(&hub);
        let formatter = hub.get::<dyn EndpointNameFormatter>().unwrap();
        assert_eq!(formatter.consumer("SubmitOrderConsumer"), "prod-submit-order");
    }

    #[test]
    fn consumers_config_defaults_when_absent() {
        let cfg = ConsumersConfig::load(&JsonConfigProvider::default()).unwrap();
        assert_eq!(cfg, ConsumersConfig::default());
    }

    #[test]
    fn consumers_config_rejects_unknown_keys() {
        let p = JsonConfigProvider::new(json!({
            "consumers": { "config": { "name_formating": "kebab-case" } }
        }));
        assert!(ConsumersConfig::load(&p).is_err());
    }
}
