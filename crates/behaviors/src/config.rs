//! Behavior engine configuration and builder

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{BehaviorResult, ConfigurationError};

/// Directory for the persistent metadata cache
pub const ENV_CACHE_DIR: &str = "ELIF_BEHAVIORS_CACHE_DIR";
/// Default user recorded by blameable and loggable listeners
pub const ENV_USERNAME: &str = "ELIF_BEHAVIORS_USERNAME";
/// Default client address recorded by the ip traceable listener
pub const ENV_IP: &str = "ELIF_BEHAVIORS_IP";
/// Word separator used by sluggable when a slug declares none
pub const ENV_SLUG_SEPARATOR: &str = "ELIF_BEHAVIORS_SLUG_SEPARATOR";
/// `false` defers metadata validation to the first flush touching a class
pub const ENV_VALIDATE_EAGERLY: &str = "ELIF_BEHAVIORS_VALIDATE_EAGERLY";

/// Settings shared by the metadata factory and the built-in listeners
//
// The builder below is the expansion of `service_builder::builder` written
// out by hand: the 0.3.0 macro re-emits fields without their visibility,
// which would make these `pub` fields private.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionsConfig {
    /// Persist extension metadata here; in-memory only when unset
    pub cache_dir: Option<PathBuf>,

    pub default_username: Option<String>,

    pub default_ip: Option<String>,

    pub slug_separator: String,

    /// Validate every listener's metadata when a class is registered
    pub validate_eagerly: bool,
}

pub struct ExtensionsConfigBuilder {
    cache_dir: Option<Option<PathBuf>>,
    default_username: Option<Option<String>>,
    default_ip: Option<Option<String>>,
    slug_separator: Option<String>,
    validate_eagerly: Option<bool>,
}

impl ExtensionsConfigBuilder {
    pub fn new() -> Self {
        Self {
            cache_dir: None,
            default_username: None,
            default_ip: None,
            slug_separator: None,
            validate_eagerly: None,
        }
    }

    pub fn cache_dir(mut self, value: Option<PathBuf>) -> Self {
        self.cache_dir = Some(value);
        self
    }

    pub fn default_username(mut self, value: Option<String>) -> Self {
        self.default_username = Some(value);
        self
    }

    pub fn default_ip(mut self, value: Option<String>) -> Self {
        self.default_ip = Some(value);
        self
    }

    pub fn slug_separator(mut self, value: String) -> Self {
        self.slug_separator = Some(value);
        self
    }

    pub fn validate_eagerly(mut self, value: bool) -> Self {
        self.validate_eagerly = Some(value);
        self
    }

    pub fn build(self) -> Result<ExtensionsConfig, service_builder::error::BuildError> {
        self.build_with_defaults()
    }

    pub fn build_with_defaults(self) -> Result<ExtensionsConfig, service_builder::error::BuildError> {
        Ok(ExtensionsConfig {
            cache_dir: self.cache_dir.unwrap_or_else(|| None),
            default_username: self.default_username.unwrap_or_else(|| None),
            default_ip: self.default_ip.unwrap_or_else(|| None),
            slug_separator: self.slug_separator.unwrap_or_else(|| "-".to_string()),
            validate_eagerly: self.validate_eagerly.unwrap_or_else(|| true),
        })
    }
}

impl ExtensionsConfig {
    pub fn builder() -> ExtensionsConfigBuilder {
        ExtensionsConfigBuilder::new()
    }
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            default_username: None,
            default_ip: None,
            slug_separator: "-".to_string(),
            validate_eagerly: true,
        }
    }
}

impl ExtensionsConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> BehaviorResult<Self> {
        let mut config = Self::default();

        if let Some(dir) = non_empty_var(ENV_CACHE_DIR) {
            config.cache_dir = Some(PathBuf::from(dir));
        }
        config.default_username = non_empty_var(ENV_USERNAME);
        config.default_ip = non_empty_var(ENV_IP);
        if let Some(separator) = non_empty_var(ENV_SLUG_SEPARATOR) {
            config.slug_separator = separator;
        }
        if let Some(flag) = non_empty_var(ENV_VALIDATE_EAGERLY) {
            config.validate_eagerly = parse_flag(&flag)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BehaviorResult<()> {
        if self.slug_separator.chars().any(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigurationError::invalid_option(
                "*",
                "sluggable",
                "separator",
                format!("'{}' must not contain letters or digits", self.slug_separator),
            )
            .into());
        }
        Ok(())
    }
}

impl ExtensionsConfigBuilder {
    /// Build and validate
    pub fn build_config(self) -> BehaviorResult<ExtensionsConfig> {
        let config = self
            .build_with_defaults()
            .map_err(|err| ConfigurationError::document(format!("{:?}", err)))?;
        config.validate()?;
        Ok(config)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_flag(value: &str) -> BehaviorResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigurationError::invalid_option(
            "*",
            "config",
            ENV_VALIDATE_EAGERLY,
            format!("expected a boolean, got '{}'", other),
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExtensionsConfig::default();
        assert_eq!(config.slug_separator, "-");
        assert!(config.validate_eagerly);
        assert!(config.cache_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ExtensionsConfig::builder()
            .default_username(Some("jules".to_string()))
            .slug_separator("_".to_string())
            .build_config()
            .unwrap();

        assert_eq!(config.default_username.as_deref(), Some("jules"));
        assert_eq!(config.slug_separator, "_");
        assert!(config.validate_eagerly);
    }

    #[test]
    fn test_alphanumeric_separator_rejected() {
        let config = ExtensionsConfig {
            slug_separator: "x".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("TRUE").unwrap());
        assert!(!parse_flag("off").unwrap());
        assert!(parse_flag("maybe").is_err());
    }
}
