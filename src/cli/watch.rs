//! Watch command: poll the config file and hot-reload changed plugins.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use anyhow::{Context, Result};

use chatplug::config::{ConfigLoader, LoadedConfig};
use chatplug::plugins::{PluginConfig, PluginManager, PluginSource};

use super::common::{load_config, print_report, start_manager};

/// Parse interval string like "1h", "30m", "15m", "60s" into seconds.
pub fn parse_interval(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();
    let secs = if let Some(hours) = s.strip_suffix('h') {
        let n: u64 = hours.parse().with_context(|| "Invalid hours value")?;
        n.checked_mul(3600)
            .with_context(|| format!("Interval too large: {}", s))?
    } else if let Some(mins) = s.strip_suffix('m') {
        let n: u64 = mins.parse().with_context(|| "Invalid minutes value")?;
        n.checked_mul(60)
            .with_context(|| format!("Interval too large: {}", s))?
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse().with_context(|| "Invalid seconds value")?
    } else {
        s.parse::<u64>()
            .with_context(|| "Invalid interval. Use formats like 1h, 30m, or 5s")?
    };
    if secs == 0 {
        anyhow::bail!("Interval must be at least one second");
    }
    Ok(secs)
}

/// Hash of the config text, to skip re-parsing an unchanged file.
fn content_hash(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// What changed between two sets of plugin sections.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct PluginDiff {
    /// New, or previously disabled and now enabled.
    pub added: Vec<PluginConfig>,
    /// Enabled before and after, with a different section.
    pub changed: Vec<PluginConfig>,
    /// Gone, or now disabled.
    pub removed: Vec<String>,
}

impl PluginDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

pub(crate) fn diff_plugins(old: &[PluginConfig], new: &[PluginConfig]) -> PluginDiff {
    let mut diff = PluginDiff::default();
    let enabled = |list: &[PluginConfig], name: &str| {
        list.iter().find(|c| c.name == name && c.enabled).cloned()
    };

    for config in new.iter().filter(|c| c.enabled) {
        match enabled(old, &config.name) {
            None => diff.added.push(config.clone()),
            Some(previous) if previous != *config => diff.changed.push(config.clone()),
            Some(_) => {}
        }
    }
    for config in old.iter().filter(|c| c.enabled) {
        if enabled(new, &config.name).is_none() {
            diff.removed.push(config.name.clone());
        }
    }
    diff
}

/// Apply `diff` to a running manager. Failures are printed, never fatal.
pub(crate) async fn apply_diff(manager: &PluginManager, diff: PluginDiff) {
    let stamp = chrono::Local::now().format("%H:%M:%S").to_string();

    for name in diff.removed {
        match manager.unload_plugin(&name).await {
            Ok(()) => println!("[{}] Unloaded {}", stamp, name),
            Err(e) => eprintln!("[{}] Unload of {} failed: {}", stamp, name, e),
        }
    }

    for config in diff.changed {
        let name = config.name.clone();
        let source = PluginSource::parse(config.source_or_name());
        let result = if manager.registry().contains(&name) {
            manager.reload_plugin(&name, Some(source), Some(config)).await
        } else {
            manager.load_plugin(&source, config).await
        };
        match result {
            Ok(()) => println!("[{}] Reloaded {}", stamp, name),
            Err(e) => eprintln!("[{}] Reload of {} failed: {}", stamp, name, e),
        }
    }

    if !diff.added.is_empty() {
        let report = manager.initialize(&diff.added).await.into_data().unwrap_or_default();
        for name in &report.loaded {
            println!("[{}] Loaded {}", stamp, name);
        }
        print_report(&report);
    }
}

pub(crate) async fn cmd_watch(config: Option<PathBuf>, interval: String, force: bool) -> Result<()> {
    let interval_secs = parse_interval(&interval)?;
    let (path, mut current) = load_config(config.as_deref())?;

    if !current.manager.hot_reload && !force {
        anyhow::bail!(
            "Hot reload is disabled. Set manager.hot_reload = true in {} or pass --force",
            path.display()
        );
    }

    let (manager, _) = start_manager(&current).await?;
    let mut last_hash = std::fs::read_to_string(&path)
        .map(|t| content_hash(&t))
        .unwrap_or_default();

    println!("Watching: {}", path.display());
    println!("Interval: {} ({}s)", interval, interval_secs);
    println!();
    println!("Press Ctrl+C to stop.");
    println!();

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("[{}] Read error: {}", chrono::Local::now().format("%H:%M"), e);
                continue;
            }
        };
        let hash = content_hash(&text);
        if hash == last_hash {
            continue;
        }
        last_hash = hash;

        let next: LoadedConfig = match ConfigLoader::new().load_str(&text) {
            Ok(next) => next,
            Err(e) => {
                eprintln!(
                    "[{}] Config rejected, keeping current plugins: {}",
                    chrono::Local::now().format("%H:%M"),
                    e
                );
                continue;
            }
        };
        for issue in &next.issues {
            eprintln!("config: {}", issue);
        }
        if next.manager != current.manager {
            eprintln!("Manager settings changed; restart to apply them");
        }

        let diff = diff_plugins(&current.plugins, &next.plugins);
        if diff.is_empty() {
            eprintln!("[{}] No plugin changes", chrono::Local::now().format("%H:%M"));
        } else {
            apply_diff(&manager, diff).await;
        }
        current = next;
    }

    println!();
    println!("Stopping...");
    manager.shutdown().await;
    Ok(())
}
