//! Plugin discovery and loading for chatplug
//!
//! Plugins are compiled in. The loader keeps a table of named factories and
//! resolves a [`PluginSource`] into exactly one instance: either directly
//! by factory name, or through a `plugin.json` manifest that names a
//! factory. Every instance is checked for shape (capabilities, category,
//! metadata) before it is handed back.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PluginError, Result};
use crate::session::Metadata;

use super::traits::{capabilities_of, Plugin};
use super::types::{is_valid_plugin_name, Capability};

/// Builds one plugin instance named by the argument.
pub type PluginFactory =
    Arc<dyn Fn(&str) -> std::result::Result<Arc<dyn Plugin>, String> + Send + Sync>;

/// Manifest file looked for inside each plugin directory.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Where a plugin comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PluginSource {
    /// A factory registered with [`PluginLoader::register_factory`].
    Factory(String),
    /// A `plugin.json` manifest, or a directory containing one.
    Manifest(PathBuf),
}

impl PluginSource {
    /// Interpret a config `source` string: anything that looks like a path
    /// (ends in `.json` or contains a separator) is a manifest, everything
    /// else a factory name.
    pub fn parse(source: &str) -> Self {
        let trimmed = source.trim();
        if trimmed.ends_with(".json") || trimmed.contains('/') || trimmed.contains('\\') {
            Self::Manifest(expand_home(trimmed))
        } else {
            Self::Factory(trimmed.to_string())
        }
    }
}

impl fmt::Display for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Factory(name) => write!(f, "factory:{}", name),
            Self::Manifest(path) => write!(f, "manifest:{}", path.display()),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Contents of a `plugin.json`.
///
/// ```json
/// {
///   "name": "shoutyFilter",
///   "factory": "content-filter",
///   "description": "Masks words in all caps",
///   "settings": { "blocked_terms": ["LOUD"] }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Instance name; also the plugin's registry key.
    pub name: String,
    /// Name of the compiled-in factory to instantiate.
    pub factory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Defaults merged under the config section's own settings.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub settings: Metadata,
}

/// A manifest found by [`discover_sources`].
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPlugin {
    pub manifest: PluginManifest,
    pub path: PathBuf,
}

impl DiscoveredPlugin {
    pub fn source(&self) -> PluginSource {
        PluginSource::Manifest(self.path.clone())
    }
}

/// Discover plugin manifests across multiple directories.
///
/// Scans each provided directory for subdirectories containing a
/// `plugin.json` file. Invalid manifests are logged as warnings but do not
/// cause the overall discovery to fail.
///
/// # Arguments
/// * `dirs` - Slice of directory paths to scan
///
/// # Returns
/// Every valid manifest, sorted by plugin name.
pub fn discover_sources(dirs: &[PathBuf]) -> Result<Vec<DiscoveredPlugin>> {
    let mut found = Vec::new();

    for dir in dirs {
        if !dir.exists() {
            info!(dir = %dir.display(), "Plugin directory does not exist, skipping");
            continue;
        }

        if !dir.is_dir() {
            warn!(path = %dir.display(), "Plugin path is not a directory, skipping");
            continue;
        }

        let entries = fs::read_dir(dir).map_err(|e| {
            PluginError::Config(format!(
                "Failed to read plugin directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| {
                PluginError::Config(format!("Failed to read directory entry: {}", e))
            })?;

            let entry_path = entry.path();
            if !entry_path.is_dir() {
                continue;
            }

            let manifest_path = entry_path.join(MANIFEST_FILE);
            if !manifest_path.exists() {
                continue;
            }

            match read_manifest(&manifest_path) {
                Ok(manifest) => {
                    info!(
                        plugin = %manifest.name,
                        factory = %manifest.factory,
                        "Discovered plugin"
                    );
                    found.push(DiscoveredPlugin {
                        manifest,
                        path: manifest_path,
                    });
                }
                Err(e) => {
                    warn!(
                        dir = %entry_path.display(),
                        error = %e,
                        "Failed to read plugin manifest, skipping"
                    );
                }
            }
        }
    }

    found.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
    Ok(found)
}

/// Read and validate a manifest from a `plugin.json` path or the directory
/// holding one.
pub fn read_manifest(path: &Path) -> Result<PluginManifest> {
    let manifest_path = if path.is_dir() {
        path.join(MANIFEST_FILE)
    } else {
        path.to_path_buf()
    };

    if !manifest_path.exists() {
        return Err(PluginError::Load(format!(
            "No {} found at {}",
            MANIFEST_FILE,
            manifest_path.display()
        )));
    }

    let content = fs::read_to_string(&manifest_path).map_err(|e| {
        PluginError::Load(format!("Failed to read {}: {}", manifest_path.display(), e))
    })?;

    let manifest: PluginManifest = serde_json::from_str(&content)?;
    validate_manifest(&manifest)?;
    Ok(manifest)
}

/// Validate a manifest's names.
///
/// # Returns
/// `Ok(())` if valid, or `PluginError::Load` describing the violation.
pub fn validate_manifest(manifest: &PluginManifest) -> Result<()> {
    if !is_valid_plugin_name(&manifest.name) {
        return Err(PluginError::Load(format!(
            "Invalid plugin name '{}': must be 1-64 letters, digits, '_' or '-', starting with a letter",
            manifest.name
        )));
    }

    if manifest.factory.trim().is_empty() {
        return Err(PluginError::Load(format!(
            "Plugin '{}' does not name a factory",
            manifest.name
        )));
    }

    Ok(())
}

/// Check an instance's shape.
///
/// The plugin must expose at least one capability view, its declared
/// category must be among them, its metadata must be valid and its name
/// must match `expected_name`. Returns the exposed capabilities.
pub fn validate_instance(plugin: &Arc<dyn Plugin>, expected_name: &str) -> Result<Vec<Capability>> {
    let meta = plugin.metadata();
    meta.validate()?;

    if meta.name != expected_name {
        return Err(PluginError::Load(format!(
            "Plugin reports name '{}' but was loaded as '{}'",
            meta.name, expected_name
        )));
    }

    let capabilities = capabilities_of(plugin);
    if capabilities.is_empty() {
        return Err(PluginError::Load(format!(
            "Plugin '{}' exposes no recognized capability",
            meta.name
        )));
    }

    if !capabilities.contains(&meta.category) {
        return Err(PluginError::Load(format!(
            "Plugin '{}' declares category '{}' but only exposes {:?}",
            meta.name, meta.category, capabilities
        )));
    }

    Ok(capabilities)
}

/// Resolves sources into instances through a table of named factories.
#[derive(Default, Clone)]
pub struct PluginLoader {
    factories: HashMap<String, PluginFactory>,
}

impl PluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory under `name`, replacing any previous one.
    pub fn register_factory<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> std::result::Result<Arc<dyn Plugin>, String> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(factory = %name, "Registered plugin factory");
        self.factories.insert(name, Arc::new(factory));
    }

    pub fn has_factory(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered factory names, sorted.
    pub fn factory_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Produce and validate one instance named `instance` from `source`.
    ///
    /// For a manifest the manifest's own name is used and must equal
    /// `instance`. Factory errors and panics become `PluginError::Load`.
    pub fn load_from_source(&self, source: &PluginSource, instance: &str) -> Result<Arc<dyn Plugin>> {
        let factory_name = match source {
            PluginSource::Factory(name) => name.clone(),
            PluginSource::Manifest(path) => {
                let manifest = read_manifest(path)?;
                if manifest.name != instance {
                    return Err(PluginError::Load(format!(
                        "Manifest {} defines '{}', expected '{}'",
                        path.display(),
                        manifest.name,
                        instance
                    )));
                }
                manifest.factory
            }
        };

        let plugin = self.instantiate(&factory_name, instance)?;
        let capabilities = validate_instance(&plugin, instance)?;
        info!(
            plugin = instance,
            source = %source,
            capabilities = ?capabilities,
            "Loaded plugin"
        );
        Ok(plugin)
    }

    fn instantiate(&self, factory_name: &str, instance: &str) -> Result<Arc<dyn Plugin>> {
        let factory = self.factories.get(factory_name).ok_or_else(|| {
            PluginError::Load(format!("Unknown plugin factory '{}'", factory_name))
        })?;

        match catch_unwind(AssertUnwindSafe(|| factory(instance))) {
            Ok(Ok(plugin)) => Ok(plugin),
            Ok(Err(message)) => Err(PluginError::Load(format!(
                "Factory '{}' failed for '{}': {}",
                factory_name, instance, message
            ))),
            Err(_) => Err(PluginError::Load(format!(
                "Factory '{}' panicked while building '{}'",
                factory_name, instance
            ))),
        }
    }
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLoader")
            .field("factories", &self.factory_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::result::PluginResult;
    use crate::plugins::traits::MessageProcessor;
    use crate::plugins::types::{PluginConfig, PluginMetadata};
    use crate::session::{ChatContext, Message};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Upper {
        meta: PluginMetadata,
    }

    #[async_trait]
    impl Plugin for Upper {
        fn metadata(&self) -> &PluginMetadata {
            &self.meta
        }

        async fn initialize(&self, _config: &PluginConfig) -> PluginResult<()> {
            PluginResult::ok(())
        }

        fn as_message_processor(self: Arc<Self>) -> Option<Arc<dyn MessageProcessor>> {
            Some(self)
        }
    }

    #[async_trait]
    impl MessageProcessor for Upper {
        async fn process_message(
            &self,
            message: Message,
            _context: &ChatContext,
        ) -> PluginResult<Message> {
            let content = message.content.to_uppercase();
            PluginResult::ok(message.with_content(content))
        }
    }

    struct Shapeless {
        meta: PluginMetadata,
    }

    #[async_trait]
    impl Plugin for Shapeless {
        fn metadata(&self) -> &PluginMetadata {
            &self.meta
        }

        async fn initialize(&self, _config: &PluginConfig) -> PluginResult<()> {
            PluginResult::ok(())
        }
    }

    fn loader() -> PluginLoader {
        let mut loader = PluginLoader::new();
        loader.register_factory("upper", |name: &str| {
            Ok(Arc::new(Upper {
                meta: PluginMetadata::new(name, "1.0.0", Capability::MessageProcessor),
            }) as Arc<dyn Plugin>)
        });
        loader.register_factory("mislabeled", |name: &str| {
            Ok(Arc::new(Upper {
                meta: PluginMetadata::new(name, "1.0.0", Capability::Backend),
            }) as Arc<dyn Plugin>)
        });
        loader.register_factory("shapeless", |name: &str| {
            Ok(Arc::new(Shapeless {
                meta: PluginMetadata::new(name, "1.0.0", Capability::Extension),
            }) as Arc<dyn Plugin>)
        });
        loader.register_factory("refuses", |_name: &str| Err("missing api key".to_string()));
        loader.register_factory("explodes", |_name: &str| -> std::result::Result<Arc<dyn Plugin>, String> {
            panic!("factory bug")
        });
        loader
    }

    /// Helper to write a plugin.json file into a directory.
    fn write_manifest(dir: &Path, name: &str, factory: &str) {
        fs::create_dir_all(dir).unwrap();
        let manifest = PluginManifest {
            name: name.to_string(),
            factory: factory.to_string(),
            description: None,
            settings: Metadata::new(),
        };
        fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
    }

    // ---- PluginSource ----

    #[test]
    fn test_source_parse() {
        assert_eq!(
            PluginSource::parse("content-filter"),
            PluginSource::Factory("content-filter".into())
        );
        assert_eq!(
            PluginSource::parse("./plugins/shout/plugin.json"),
            PluginSource::Manifest(PathBuf::from("./plugins/shout/plugin.json"))
        );
        assert_eq!(
            PluginSource::parse("plugins/shout"),
            PluginSource::Manifest(PathBuf::from("plugins/shout"))
        );
    }

    // ---- factories ----

    #[test]
    fn test_load_from_factory() {
        let plugin = loader()
            .load_from_source(&PluginSource::Factory("upper".into()), "shout")
            .unwrap();
        assert_eq!(plugin.metadata().name, "shout");
        assert_eq!(capabilities_of(&plugin), vec![Capability::MessageProcessor]);
    }

    #[test]
    fn test_unknown_factory() {
        let err = loader()
            .load_from_source(&PluginSource::Factory("nope".into()), "x")
            .err().unwrap();
        assert!(matches!(err, PluginError::Load(ref m) if m.contains("Unknown plugin factory")));
    }

    #[test]
    fn test_factory_error_and_panic_become_load_errors() {
        let l = loader();
        let err = l
            .load_from_source(&PluginSource::Factory("refuses".into()), "x")
            .err().unwrap();
        assert!(err.to_string().contains("missing api key"));

        let err = l
            .load_from_source(&PluginSource::Factory("explodes".into()), "x")
            .err().unwrap();
        assert!(matches!(err, PluginError::Load(ref m) if m.contains("panicked")));
    }

    #[test]
    fn test_shape_checks() {
        let l = loader();
        let err = l
            .load_from_source(&PluginSource::Factory("shapeless".into()), "x")
            .err().unwrap();
        assert!(err.to_string().contains("no recognized capability"));

        let err = l
            .load_from_source(&PluginSource::Factory("mislabeled".into()), "x")
            .err().unwrap();
        assert!(err.to_string().contains("declares category"));

        let err = l
            .load_from_source(&PluginSource::Factory("upper".into()), "1bad")
            .err().unwrap();
        assert!(matches!(err, PluginError::Load(_)));
    }

    #[test]
    fn test_factory_names_sorted() {
        let names = loader().factory_names();
        assert_eq!(names.first().map(String::as_str), Some("explodes"));
        assert!(loader().has_factory("upper"));
    }

    // ---- manifests ----

    #[test]
    fn test_load_from_manifest() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("shout");
        write_manifest(&dir, "shout", "upper");

        let l = loader();
        let plugin = l
            .load_from_source(&PluginSource::Manifest(dir.clone()), "shout")
            .unwrap();
        assert_eq!(plugin.metadata().name, "shout");

        let err = l
            .load_from_source(&PluginSource::Manifest(dir.join(MANIFEST_FILE)), "other")
            .err().unwrap();
        assert!(err.to_string().contains("expected 'other'"));
    }

    #[test]
    fn test_missing_manifest() {
        let tmp = TempDir::new().unwrap();
        let err = read_manifest(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("No plugin.json found"));
    }

    #[test]
    fn test_validate_manifest() {
        let mut manifest = PluginManifest {
            name: "ok-name".into(),
            factory: "upper".into(),
            description: None,
            settings: Metadata::new(),
        };
        assert!(validate_manifest(&manifest).is_ok());

        manifest.factory = "  ".into();
        assert!(validate_manifest(&manifest).is_err());

        manifest.factory = "upper".into();
        manifest.name = "has space".into();
        assert!(validate_manifest(&manifest).is_err());
    }

    // ---- discover_sources ----

    #[test]
    fn test_discover_sources() {
        let tmp = TempDir::new().unwrap();
        write_manifest(&tmp.path().join("b"), "beta", "upper");
        write_manifest(&tmp.path().join("a"), "alpha", "upper");
        fs::write(tmp.path().join("not-a-dir.txt"), "hello").unwrap();
        fs::create_dir(tmp.path().join("empty-dir")).unwrap();

        let broken = tmp.path().join("broken");
        fs::create_dir(&broken).unwrap();
        fs::write(broken.join(MANIFEST_FILE), "{ broken json").unwrap();

        let found = discover_sources(&[tmp.path().to_path_buf()]).unwrap();
        let names: Vec<&str> = found.iter().map(|d| d.manifest.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert!(matches!(found[0].source(), PluginSource::Manifest(_)));
    }

    #[test]
    fn test_discover_nonexistent_directory() {
        let found = discover_sources(&[PathBuf::from("/nonexistent/path/plugins")]).unwrap();
        assert!(found.is_empty());
    }
}
