//! Metrics command: render hook metrics after optional sample traffic.

use std::path::PathBuf;

use anyhow::{anyhow, Result};

use chatplug::session::ChatContext;
use chatplug::utils::telemetry::{render, TelemetryFormat};

use super::common::{load_config, start_manager};
use super::run::exchange;

pub(crate) async fn cmd_metrics(
    config: Option<PathBuf>,
    format: Option<String>,
    messages: Vec<String>,
    model: String,
) -> Result<()> {
    let (_, loaded) = load_config(config.as_deref())?;
    let format = match format {
        Some(f) => f.parse::<TelemetryFormat>().map_err(|e| anyhow!(e))?,
        None => loaded.manager.telemetry.format,
    };
    let (manager, _) = start_manager(&loaded).await?;

    for message in messages {
        let ctx = ChatContext::from_user(model.clone(), message);
        if let Err(e) = exchange(&manager, ctx, None).await {
            eprintln!("sample request failed: {}", e);
        }
    }

    print!("{}", render(&manager.metrics(None, None), format));
    manager.shutdown().await;
    Ok(())
}
