//! Status command: load every configured plugin and report its state.

use std::path::PathBuf;

use anyhow::Result;

use chatplug::plugins::{PluginHealth, PluginStatus};

use super::common::{load_config, start_manager};

pub(crate) async fn cmd_status(config: Option<PathBuf>, json: bool) -> Result<()> {
    let (path, loaded) = load_config(config.as_deref())?;
    let (manager, report) = start_manager(&loaded).await?;

    let statuses = manager.plugin_status();
    let health = manager.health_check().await;

    if json {
        let out = serde_json::json!({
            "config": path.display().to_string(),
            "plugins": statuses,
            "health": health,
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("Config: {}", path.display());
        println!();
        print!("{}", format_table(&statuses, &health));
    }

    manager.shutdown().await;
    Ok(())
}

fn format_table(statuses: &[PluginStatus], health: &[PluginHealth]) -> String {
    if statuses.is_empty() {
        return "No plugins loaded.\n".to_string();
    }

    let mut out = format!(
        "{:<20} {:<9} {:<13} {:>8}  {:<28} {}\n",
        "NAME", "VERSION", "STATE", "PRIORITY", "CAPABILITIES", "HEALTH"
    );
    for status in statuses {
        let capabilities: Vec<&str> = status.capabilities.iter().map(|c| c.as_str()).collect();
        let health = health
            .iter()
            .find(|h| h.name == status.name)
            .map(|h| match (h.result.data(), h.result.error()) {
                (Some(s), _) => format!("{:?}", s).to_lowercase(),
                (None, Some(err)) => err.to_string(),
                (None, None) => "-".to_string(),
            })
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<20} {:<9} {:<13} {:>8}  {:<28} {}\n",
            status.name,
            status.version,
            status.state.as_str(),
            status.priority,
            capabilities.join(","),
            health
        ));
        if let Some(err) = &status.last_error {
            out.push_str(&format!("    last error: {}\n", err));
        }
    }
    out
}
