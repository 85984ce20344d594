//! Configuration loading for chatplug
//!
//! The configuration document has a `manager` section with global settings
//! and a `plugins` table keyed by plugin name:
//!
//! ```json5
//! {
//!   manager: { max_concurrency: 10, default_timeout_secs: 30 },
//!   plugins: {
//!     contentFilter: {
//!       source: "content-filter",
//!       priority: 10,
//!       settings: { blocked_terms: ["${BLOCKED_TERM:darn}"] },
//!     },
//!   },
//! }
//! ```
//!
//! JSON5 syntax is accepted (comments, trailing commas, unquoted keys).
//! Every string value may reference environment variables as `${NAME}` or
//! `${NAME:default}`. Each plugin section is validated on its own: a bad
//! section is reported in [`LoadedConfig::issues`] and skipped, the others
//! still load. A bad `manager` section fails the whole load.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{PluginError, Result};
use crate::hooks::{BreakerConfig, HookManagerConfig};
use crate::plugins::PluginConfig;
use crate::utils::telemetry::TelemetryConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "CHATPLUG_CONFIG";

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").expect("placeholder pattern")
});

/// `~/.chatplug`, or `./.chatplug` when there is no home directory.
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatplug")
}

/// `~/.chatplug/config.json`.
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.json")
}

/// The config file to use: `explicit`, else `$CHATPLUG_CONFIG`, else the
/// default path.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => default_config_path(),
    }
}

// ============================================================================
// Manager section
// ============================================================================

/// Global settings, the `manager` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Callbacks allowed in flight at once across all pipelines.
    #[serde(alias = "maxConcurrency", deserialize_with = "crate::utils::lenient::from_str_or_value")]
    pub max_concurrency: usize,

    /// Hook timeout for registrations that do not set their own.
    #[serde(alias = "defaultTimeoutSecs", alias = "defaultTimeout", deserialize_with = "crate::utils::lenient::from_str_or_value")]
    pub default_timeout_secs: u64,

    /// Whether `chatplug watch` should reload plugins on config changes.
    #[serde(alias = "hotReload", deserialize_with = "crate::utils::lenient::from_str_or_value")]
    pub hot_reload: bool,

    /// Default environment tag for plugin sections that do not set one.
    pub environment: String,

    /// Directories scanned for `plugin.json` manifests.
    #[serde(alias = "pluginDirs")]
    pub plugin_dirs: Vec<String>,

    #[serde(alias = "circuitBreaker")]
    pub circuit_breaker: BreakerConfig,

    pub telemetry: TelemetryConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            default_timeout_secs: 30,
            hot_reload: false,
            environment: "development".to_string(),
            plugin_dirs: Vec::new(),
            circuit_breaker: BreakerConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(PluginError::Config(
                "manager.max_concurrency must be > 0".to_string(),
            ));
        }
        if self.default_timeout_secs == 0
            || self.default_timeout_secs > PluginConfig::MAX_TIMEOUT_SECS
        {
            return Err(PluginError::Config(format!(
                "manager.default_timeout_secs must be between 1 and {}",
                PluginConfig::MAX_TIMEOUT_SECS
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(PluginError::Config(
                "manager.circuit_breaker.failure_threshold must be > 0".to_string(),
            ));
        }
        if self.environment.trim().is_empty() {
            return Err(PluginError::Config(
                "manager.environment must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn hook_config(&self) -> HookManagerConfig {
        HookManagerConfig {
            max_concurrency: self.max_concurrency,
            default_timeout: std::time::Duration::from_secs(self.default_timeout_secs),
            breaker: self.circuit_breaker,
        }
    }

    /// Plugin directories with `~/` expanded.
    pub fn plugin_dirs(&self) -> Vec<PathBuf> {
        self.plugin_dirs
            .iter()
            .map(|dir| match dir.strip_prefix("~/") {
                Some(rest) => dirs::home_dir()
                    .map(|home| home.join(rest))
                    .unwrap_or_else(|| PathBuf::from(dir)),
                None => PathBuf::from(dir),
            })
            .collect()
    }
}

// ============================================================================
// Load result
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Loaded, but something looks wrong (e.g. an unset variable).
    Warning,
    /// The section was skipped.
    Error,
}

/// Something the loader noticed while reading the document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigIssue {
    /// Dotted path of the offending value, e.g. `plugins.logger`.
    pub section: String,
    pub severity: IssueSeverity,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            IssueSeverity::Warning => "warning",
            IssueSeverity::Error => "error",
        };
        write!(f, "{} [{}]: {}", level, self.section, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedConfig {
    pub manager: ManagerConfig,
    /// Valid plugin sections, sorted by name.
    pub plugins: Vec<PluginConfig>,
    pub issues: Vec<ConfigIssue>,
}

impl LoadedConfig {
    pub fn plugin(&self, name: &str) -> Option<&PluginConfig> {
        self.plugins.iter().find(|p| p.name == name)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ConfigIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ConfigIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
    }
}

// ============================================================================
// Loader
// ============================================================================

/// Parses configuration documents. Build one at startup and hand its
/// output to [`crate::plugins::PluginManager::new`].
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    /// Variables to substitute from; `None` reads the process environment.
    env: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Substitute from `env` instead of the process environment.
    pub fn with_env(env: HashMap<String, String>) -> Self {
        Self { env: Some(env) }
    }

    pub fn load_file(&self, path: &Path) -> Result<LoadedConfig> {
        let text = fs::read_to_string(path).map_err(|e| {
            PluginError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loading configuration");
        self.load_str(&text)
    }

    pub fn load_str(&self, text: &str) -> Result<LoadedConfig> {
        let raw: Value = json5::from_str(text)
            .map_err(|e| PluginError::Config(format!("Failed to parse configuration: {}", e)))?;

        let mut issues = Vec::new();
        let Value::Object(mut root) = self.substitute(raw, "", &mut issues) else {
            return Err(PluginError::Config(
                "Configuration must be an object".to_string(),
            ));
        };

        let manager: ManagerConfig = match root.remove("manager") {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| PluginError::Config(format!("manager: {}", e)))?,
            None => ManagerConfig::default(),
        };
        manager.validate()?;

        let sections = match root.remove("plugins") {
            Some(Value::Object(sections)) => sections,
            Some(_) => {
                return Err(PluginError::Config(
                    "plugins must be an object keyed by plugin name".to_string(),
                ))
            }
            None => Map::new(),
        };

        for key in root.keys() {
            issues.push(ConfigIssue {
                section: key.clone(),
                severity: IssueSeverity::Warning,
                message: "unknown top-level key ignored".to_string(),
            });
        }

        let mut plugins = Vec::new();
        for (name, section) in sections {
            match plugin_section(&name, section, &manager.environment) {
                Ok(config) => plugins.push(config),
                Err(e) => {
                    warn!(plugin = %name, error = %e, "Skipping invalid plugin section");
                    issues.push(ConfigIssue {
                        section: format!("plugins.{}", name),
                        severity: IssueSeverity::Error,
                        message: e.to_string(),
                    });
                }
            }
        }
        plugins.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(LoadedConfig {
            manager,
            plugins,
            issues,
        })
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match &self.env {
            Some(env) => env.get(name).cloned(),
            None => std::env::var(name).ok(),
        }
    }

    fn substitute(&self, value: Value, path: &str, issues: &mut Vec<ConfigIssue>) -> Value {
        match value {
            Value::String(s) => self.substitute_str(&s, path, issues),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| self.substitute(item, &format!("{}[{}]", path, i), issues))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| {
                        let child = if path.is_empty() {
                            k.clone()
                        } else {
                            format!("{}.{}", path, k)
                        };
                        let v = self.substitute(v, &child, issues);
                        (k, v)
                    })
                    .collect(),
            ),
            other => other,
        }
    }

    /// Placeholders always resolve to a string; typed fields parse it.
    fn substitute_str(&self, s: &str, path: &str, issues: &mut Vec<ConfigIssue>) -> Value {
        if !PLACEHOLDER_RE.is_match(s) {
            return Value::String(s.to_string());
        }

        let replaced = PLACEHOLDER_RE.replace_all(s, |caps: &Captures| {
            let name = &caps[1];
            match (self.lookup(name), caps.get(2)) {
                (Some(value), _) => value,
                (None, Some(default)) => default.as_str().to_string(),
                (None, None) => {
                    issues.push(ConfigIssue {
                        section: path.to_string(),
                        severity: IssueSeverity::Warning,
                        message: format!("environment variable {} is not set", name),
                    });
                    String::new()
                }
            }
        });

        Value::String(replaced.into_owned())
    }
}

fn plugin_section(name: &str, section: Value, environment: &str) -> Result<PluginConfig> {
    let Value::Object(mut fields) = section else {
        return Err(PluginError::Config(format!(
            "Plugin '{}': section must be an object",
            name
        )));
    };
    fields.insert("name".to_string(), Value::String(name.to_string()));
    fields
        .entry("environment")
        .or_insert_with(|| Value::String(environment.to_string()));

    let config: PluginConfig = serde_json::from_value(Value::Object(fields))
        .map_err(|e| PluginError::Config(format!("Plugin '{}': {}", name, e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn loader(vars: &[(&str, &str)]) -> ConfigLoader {
        ConfigLoader::with_env(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_for_empty_document() {
        let loaded = loader(&[]).load_str("{}").unwrap();
        assert_eq!(loaded.manager, ManagerConfig::default());
        assert!(loaded.plugins.is_empty());
        assert!(loaded.issues.is_empty());
    }

    #[test]
    fn test_json5_and_camel_case() {
        let text = r#"{
            // comments are fine
            manager: { maxConcurrency: 4, hotReload: true, environment: "production" },
            plugins: {
                logger: { priority: 90, maxRetries: 1, timeoutSeconds: 5, rateLimit: 60, },
            },
        }"#;
        let loaded = loader(&[]).load_str(text).unwrap();
        assert_eq!(loaded.manager.max_concurrency, 4);
        assert!(loaded.manager.hot_reload);

        let logger = loaded.plugin("logger").unwrap();
        assert_eq!(logger.priority, 90);
        assert_eq!(logger.max_retries, 1);
        assert_eq!(logger.timeout_seconds, 5);
        assert_eq!(logger.rate_limit, Some(60));
        assert_eq!(logger.environment, "production");
    }

    #[test]
    fn test_placeholder_substitution() {
        let text = r#"{
            "plugins": {
                "filter": {
                    "source": "${FILTER_SOURCE:content-filter}",
                    "priority": "${FILTER_PRIORITY}",
                    "enabled": "${FILTER_ON:true}",
                    "settings": { "greeting": "hello ${USER_NAME:world}!" }
                }
            }
        }"#;
        let loaded = loader(&[("FILTER_PRIORITY", "15")]).load_str(text).unwrap();
        let filter = loaded.plugin("filter").unwrap();
        assert_eq!(filter.source.as_deref(), Some("content-filter"));
        assert_eq!(filter.priority, 15);
        assert!(filter.enabled);
        assert_eq!(filter.setting_str("greeting"), Some("hello world!"));
        assert!(loaded.issues.is_empty());
    }

    #[test]
    fn test_placeholders_stay_strings() {
        let text = r#"{
            "manager": { "max_concurrency": "${WORKERS}", "hot_reload": "${HOT:false}" },
            "plugins": {
                "a": { "settings": { "pin": "${PIN}" } },
                "b": { "source": "${SRC}", "rateLimit": "${RATE:}" }
            }
        }"#;
        let loaded = loader(&[("PIN", "0123"), ("SRC", "42"), ("WORKERS", "4")])
            .load_str(text)
            .unwrap();
        assert!(loaded.issues.is_empty(), "{:?}", loaded.issues);
        assert_eq!(loaded.manager.max_concurrency, 4);
        assert!(!loaded.manager.hot_reload);

        let a = loaded.plugin("a").unwrap();
        assert_eq!(a.setting_str("pin"), Some("0123"));
        assert_eq!(a.setting_u64("pin"), Some(123));

        let b = loaded.plugin("b").unwrap();
        assert_eq!(b.source.as_deref(), Some("42"));
        assert_eq!(b.rate_limit, None);
    }

    #[test]
    fn test_missing_variable_warns() {
        let text = r#"{ "plugins": { "a": { "settings": { "key": "${API_KEY}" } } } }"#;
        let loaded = loader(&[]).load_str(text).unwrap();
        assert_eq!(loaded.plugin("a").unwrap().setting_str("key"), Some(""));
        let warning = loaded.warnings().next().unwrap();
        assert_eq!(warning.section, "plugins.a.settings.key");
        assert!(warning.message.contains("API_KEY"));
    }

    #[test]
    fn test_invalid_section_does_not_block_others() {
        let text = r#"{
            "plugins": {
                "good": { "priority": 1 },
                "slow": { "timeout_seconds": 0 },
                "typo": { "priority": "high" },
                "notAnObject": 5
            }
        }"#;
        let loaded = loader(&[]).load_str(text).unwrap();
        let names: Vec<&str> = loaded.plugins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["good"]);
        assert_eq!(loaded.errors().count(), 3);
    }

    #[test]
    fn test_invalid_manager_fails() {
        let err = loader(&[])
            .load_str(r#"{ "manager": { "max_concurrency": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, PluginError::Config(_)));

        let err = loader(&[]).load_str("[1, 2]").unwrap_err();
        assert!(err.to_string().contains("must be an object"));
    }

    #[test]
    fn test_unknown_top_level_key_warns() {
        let loaded = loader(&[]).load_str(r#"{ "extras": {} }"#).unwrap();
        assert_eq!(loaded.warnings().count(), 1);
    }

    #[test]
    fn test_load_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{ "manager": {{ "default_timeout_secs": 12 }}, "plugins": {{ "echo": {{}} }} }}"#
        )
        .unwrap();
        let loaded = loader(&[]).load_file(file.path()).unwrap();
        assert_eq!(loaded.manager.default_timeout_secs, 12);
        assert_eq!(loaded.plugins[0].name, "echo");

        let err = loader(&[])
            .load_file(Path::new("/nonexistent/chatplug.json"))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }

    #[test]
    fn test_hook_config_and_dirs() {
        let manager = ManagerConfig {
            max_concurrency: 3,
            default_timeout_secs: 7,
            plugin_dirs: vec!["/opt/plugins".into()],
            ..Default::default()
        };
        let hooks = manager.hook_config();
        assert_eq!(hooks.max_concurrency, 3);
        assert_eq!(hooks.default_timeout, std::time::Duration::from_secs(7));
        assert_eq!(manager.plugin_dirs(), vec![PathBuf::from("/opt/plugins")]);
    }

    #[test]
    fn test_resolve_config_path_explicit() {
        let path = resolve_config_path(Some(Path::new("/tmp/x.json")));
        assert_eq!(path, PathBuf::from("/tmp/x.json"));
    }
}
