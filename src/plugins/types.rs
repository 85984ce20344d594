//! Plugin types for chatplug
//!
//! This module defines the plain data types used by the plugin system:
//! identity metadata, capability categories, lifecycle states, per-plugin
//! configuration and status snapshots.

use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PluginError, Result};
use crate::utils::lenient::value_as;

/// Valid plugin names: a letter followed by up to 63 letters, digits,
/// underscores or hyphens (`contentFilter`, `echo-backend`).
pub static PLUGIN_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_\-]{0,63}$").expect("plugin name pattern is valid")
});

/// Valid versions: `major.minor.patch` with an optional pre-release/build tail.
static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+([-+][0-9A-Za-z.\-+]+)?$").expect("version pattern is valid")
});

/// Returns `true` if `name` is an acceptable plugin name.
pub fn is_valid_plugin_name(name: &str) -> bool {
    PLUGIN_NAME_RE.is_match(name)
}

// ============================================================================
// Capability
// ============================================================================

/// A named contract a plugin may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    MessageProcessor,
    Backend,
    Extension,
    Middleware,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::MessageProcessor,
        Capability::Backend,
        Capability::Extension,
        Capability::Middleware,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageProcessor => "message_processor",
            Self::Backend => "backend",
            Self::Extension => "extension",
            Self::Middleware => "middleware",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "message_processor" | "processor" => Ok(Self::MessageProcessor),
            "backend" | "backend_provider" | "provider" => Ok(Self::Backend),
            "extension" | "feature_extension" => Ok(Self::Extension),
            "middleware" => Ok(Self::Middleware),
            other => Err(PluginError::Config(format!("Unknown capability '{}'", other))),
        }
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Identity of a plugin. Set once when the plugin is instantiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Unique registry key.
    pub name: String,
    /// Semantic version string (e.g., "1.0.0").
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    /// Primary capability category.
    pub category: Capability,
    /// Names of plugins that must be `Active` before this one initializes.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>, category: Capability) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            author: String::new(),
            description: String::new(),
            category,
            dependencies: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Checks the name pattern, version format and self-dependency.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_plugin_name(&self.name) {
            return Err(PluginError::Load(format!(
                "Invalid plugin name '{}': must start with a letter and contain only letters, digits, '_' or '-' (max 64)",
                self.name
            )));
        }
        if !VERSION_RE.is_match(self.version.trim()) {
            return Err(PluginError::Load(format!(
                "Plugin '{}' has invalid version '{}': expected major.minor.patch",
                self.name, self.version
            )));
        }
        if self.dependencies.iter().any(|d| d == &self.name) {
            return Err(PluginError::Load(format!(
                "Plugin '{}' lists itself as a dependency",
                self.name
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Lifecycle state
// ============================================================================

/// Lifecycle state of a plugin. Legal transitions live in
/// [`crate::plugins::lifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Unloaded,
    Loading,
    Loaded,
    Initializing,
    Active,
    Paused,
    Error,
    Unloading,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Unloading => "unloading",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Per-plugin configuration
// ============================================================================

/// Settings for one plugin, one section of the `plugins` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Plugin name; filled from the section key by the config loader.
    pub name: String,

    /// Where to load the plugin from: a factory name or a path to a
    /// `plugin.json` manifest. Defaults to the plugin name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(deserialize_with = "crate::utils::lenient::from_str_or_value")]
    pub enabled: bool,

    /// Execution priority; lower runs earlier.
    #[serde(deserialize_with = "crate::utils::lenient::from_str_or_value")]
    pub priority: i32,

    /// Arbitrary plugin-specific settings.
    pub settings: serde_json::Map<String, Value>,

    /// Manual retries allowed after an initialization failure.
    #[serde(alias = "maxRetries", deserialize_with = "crate::utils::lenient::from_str_or_value")]
    pub max_retries: u32,

    /// Budget for each plugin call (initialize, hooks, shutdown).
    #[serde(alias = "timeoutSeconds", deserialize_with = "crate::utils::lenient::from_str_or_value")]
    pub timeout_seconds: u64,

    /// Optional cap on hook invocations per minute.
    #[serde(
        alias = "rateLimit",
        skip_serializing_if = "Option::is_none",
        deserialize_with = "crate::utils::lenient::opt_from_str_or_value"
    )]
    pub rate_limit: Option<u32>,

    /// Deployment environment tag (e.g. "development", "production").
    pub environment: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            source: None,
            enabled: true,
            priority: 100,
            settings: serde_json::Map::new(),
            max_retries: 3,
            timeout_seconds: 30,
            rate_limit: None,
            environment: "development".to_string(),
        }
    }
}

impl PluginConfig {
    pub const MAX_TIMEOUT_SECS: u64 = 3600;
    pub const MAX_RETRIES: u32 = 10;
    pub const PRIORITY_RANGE: std::ops::RangeInclusive<i32> = -10_000..=10_000;

    /// Config with defaults for the given plugin name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_setting(mut self, key: &str, value: Value) -> Self {
        self.settings.insert(key.to_string(), value);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The effective source string (falls back to the plugin name).
    pub fn source_or_name(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Look up a string setting.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }

    /// Look up a boolean setting; `"true"` and `"false"` count.
    pub fn setting_bool(&self, key: &str) -> Option<bool> {
        self.settings.get(key).and_then(value_as)
    }

    /// Look up a non-negative integer setting, native or as a string.
    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(value_as)
    }

    /// Look up a list-of-strings setting, ignoring non-string entries.
    /// A plain string is split on commas.
    pub fn setting_str_list(&self, key: &str) -> Vec<String> {
        match self.settings.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Type/range checks for every field.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_plugin_name(&self.name) {
            return Err(PluginError::Config(format!(
                "Invalid plugin name '{}'",
                self.name
            )));
        }
        if !Self::PRIORITY_RANGE.contains(&self.priority) {
            return Err(PluginError::Config(format!(
                "Plugin '{}': priority {} outside {:?}",
                self.name,
                self.priority,
                Self::PRIORITY_RANGE
            )));
        }
        if self.timeout_seconds == 0 || self.timeout_seconds > Self::MAX_TIMEOUT_SECS {
            return Err(PluginError::Config(format!(
                "Plugin '{}': timeout_seconds must be between 1 and {}",
                self.name,
                Self::MAX_TIMEOUT_SECS
            )));
        }
        if self.max_retries > Self::MAX_RETRIES {
            return Err(PluginError::Config(format!(
                "Plugin '{}': max_retries must be at most {}",
                self.name,
                Self::MAX_RETRIES
            )));
        }
        if self.rate_limit == Some(0) {
            return Err(PluginError::Config(format!(
                "Plugin '{}': rate_limit must be at least 1 call per minute",
                self.name
            )));
        }
        if let Some(source) = &self.source {
            if source.trim().is_empty() {
                return Err(PluginError::Config(format!(
                    "Plugin '{}': source must not be empty",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Health & status
// ============================================================================

/// Self-reported plugin health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Snapshot of a registered plugin for monitoring surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub version: String,
    pub category: Capability,
    pub capabilities: Vec<Capability>,
    pub state: PluginState,
    pub priority: i32,
    pub dependencies: Vec<String>,
    pub retries: u32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plugin_name_pattern() {
        assert!(is_valid_plugin_name("contentFilter"));
        assert!(is_valid_plugin_name("echo-backend"));
        assert!(is_valid_plugin_name("usage_tracker2"));
        assert!(!is_valid_plugin_name("2fast"));
        assert!(!is_valid_plugin_name(""));
        assert!(!is_valid_plugin_name("has space"));
        assert!(!is_valid_plugin_name(&"a".repeat(65)));
    }

    #[test]
    fn test_metadata_validate() {
        let meta = PluginMetadata::new("logger", "1.2.3", Capability::MessageProcessor);
        assert!(meta.validate().is_ok());

        let bad_version = PluginMetadata::new("logger", "1.2", Capability::MessageProcessor);
        assert!(matches!(bad_version.validate(), Err(PluginError::Load(_))));

        let prerelease = PluginMetadata::new("logger", "0.1.0-beta.1", Capability::Backend);
        assert!(prerelease.validate().is_ok());

        let self_dep =
            PluginMetadata::new("a", "1.0.0", Capability::Extension).with_dependencies(["a"]);
        assert!(self_dep.validate().is_err());
    }

    #[test]
    fn test_capability_from_str() {
        assert_eq!(
            "message-processor".parse::<Capability>().unwrap(),
            Capability::MessageProcessor
        );
        assert_eq!("Backend".parse::<Capability>().unwrap(), Capability::Backend);
        assert!("renderer".parse::<Capability>().is_err());
    }

    #[test]
    fn test_plugin_config_defaults_from_json() {
        let config: PluginConfig = serde_json::from_str(r#"{"priority": 10}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.priority, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout_seconds, 30);
        assert!(config.rate_limit.is_none());
    }

    #[test]
    fn test_plugin_config_camel_case_aliases() {
        let config: PluginConfig = serde_json::from_str(
            r#"{"maxRetries": 1, "timeoutSeconds": 5, "rateLimit": 60}"#,
        )
        .unwrap();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.timeout_seconds, 5);
        assert_eq!(config.rate_limit, Some(60));
    }

    #[test]
    fn test_plugin_config_validate_ranges() {
        assert!(PluginConfig::named("ok").validate().is_ok());
        assert!(PluginConfig::named("t").with_timeout_secs(0).validate().is_err());
        assert!(PluginConfig::named("t").with_timeout_secs(4000).validate().is_err());
        assert!(PluginConfig::named("p").with_priority(20_000).validate().is_err());

        let mut retries = PluginConfig::named("r");
        retries.max_retries = 11;
        assert!(retries.validate().is_err());

        let mut rate = PluginConfig::named("r");
        rate.rate_limit = Some(0);
        assert!(rate.validate().is_err());

        assert!(PluginConfig::named("bad name").validate().is_err());
    }

    #[test]
    fn test_setting_helpers() {
        let config = PluginConfig::named("f")
            .with_setting("blocked_terms", json!(["a", 1, "b"]))
            .with_setting("mode", json!("mask"));
        assert_eq!(config.setting_str_list("blocked_terms"), vec!["a", "b"]);
        assert_eq!(config.setting_str("mode"), Some("mask"));
        assert!(config.setting_str_list("missing").is_empty());
        assert_eq!(config.setting_str_list("mode"), vec!["mask"]);

        let csv = PluginConfig::named("f").with_setting("terms", json!("x, y,,z"));
        assert_eq!(csv.setting_str_list("terms"), vec!["x", "y", "z"]);

        let typed = PluginConfig::named("f")
            .with_setting("strict", json!("true"))
            .with_setting("loose", json!(false))
            .with_setting("budget", json!("500"))
            .with_setting("limit", json!(7));
        assert_eq!(typed.setting_bool("strict"), Some(true));
        assert_eq!(typed.setting_bool("loose"), Some(false));
        assert_eq!(typed.setting_u64("budget"), Some(500));
        assert_eq!(typed.setting_u64("limit"), Some(7));
        assert_eq!(typed.setting_u64("strict"), None);
    }

    #[test]
    fn test_source_or_name() {
        assert_eq!(PluginConfig::named("logger").source_or_name(), "logger");
        assert_eq!(
            PluginConfig::named("logger")
                .with_source("message-logger")
                .source_or_name(),
            "message-logger"
        );
    }
}
