//! Shared helpers for CLI commands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use chatplug::builtin::builtin_loader;
use chatplug::config::{resolve_config_path, ConfigLoader, LoadedConfig};
use chatplug::plugins::{LoadReport, PluginConfig, PluginManager};

/// Resolve and load the configuration, printing any issues to stderr.
///
/// A missing file is not an error: the defaults apply and no plugins load.
pub(crate) fn load_config(explicit: Option<&Path>) -> Result<(PathBuf, LoadedConfig)> {
    let path = resolve_config_path(explicit);
    if !path.exists() {
        if explicit.is_some() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        warn!(path = %path.display(), "No config file, using defaults");
        return Ok((path, LoadedConfig::default()));
    }

    let loaded = ConfigLoader::new()
        .load_file(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    for issue in &loaded.issues {
        eprintln!("config: {}", issue);
    }
    Ok((path, loaded))
}

/// Configured plugins plus any manifests found in the plugin directories.
pub(crate) fn plugin_configs(manager: &PluginManager, loaded: &LoadedConfig) -> Vec<PluginConfig> {
    let mut configs = loaded.plugins.clone();
    match manager.discovered_configs(&configs) {
        Ok(found) => configs.extend(found),
        Err(e) => warn!(error = %e, "Plugin discovery failed"),
    }
    configs
}

/// Build a manager with the built-in factories and load every plugin.
pub(crate) async fn start_manager(loaded: &LoadedConfig) -> Result<(PluginManager, LoadReport)> {
    loaded
        .manager
        .validate()
        .with_context(|| "Invalid manager configuration")?;
    let manager = PluginManager::new(loaded.manager.clone(), builtin_loader());
    let configs = plugin_configs(&manager, loaded);
    let report = manager.initialize(&configs).await.into_data().unwrap_or_default();
    print_report(&report);
    Ok((manager, report))
}

pub(crate) fn print_report(report: &LoadReport) {
    for failure in &report.failed {
        eprintln!("  [{}] {} failed: {}", failure.kind, failure.name, failure.error);
    }
    if !report.skipped.is_empty() {
        eprintln!("  skipped (disabled): {}", report.skipped.join(", "));
    }
}
