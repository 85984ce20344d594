//! Run command: push one message through the full pipeline.
//!
//! `request_started` → `before_message` → `before_request` → backend →
//! `after_response` → `after_message` → `request_completed`.

use std::path::PathBuf;

use anyhow::{anyhow, Result};

use chatplug::hooks::HookEvent;
use chatplug::plugins::{BackendProvider, Capability, PluginManager};
use chatplug::session::ChatContext;

use super::common::{load_config, start_manager};

/// Run one request through `manager` and return the final context.
///
/// Hook failures are printed and the pipeline carries on; only a missing
/// or failing backend aborts.
pub(crate) async fn exchange(
    manager: &PluginManager,
    context: ChatContext,
    backend: Option<&str>,
) -> Result<ChatContext> {
    let backend_name = match backend {
        Some(name) => name.to_string(),
        None => manager
            .active_with(Capability::Backend)
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No active backend plugin. Configure one, e.g. \"source\": \"echo-backend\""))?,
    };
    let provider = manager
        .backend(&backend_name)
        .ok_or_else(|| anyhow!("Backend '{}' is not an active backend plugin", backend_name))?;

    let mut ctx = context;
    for event in [HookEvent::RequestStarted, HookEvent::BeforeMessage, HookEvent::BeforeRequest] {
        ctx = stage(manager, &event, ctx).await;
    }

    let reply = provider
        .chat(&ctx)
        .await
        .into_result()
        .map_err(|e| anyhow!("Backend '{}' failed: {}", backend_name, e))?;
    ctx = ctx.append(reply);

    for event in [HookEvent::AfterResponse, HookEvent::AfterMessage, HookEvent::RequestCompleted] {
        ctx = stage(manager, &event, ctx).await;
    }
    Ok(ctx)
}

async fn stage(manager: &PluginManager, event: &HookEvent, ctx: ChatContext) -> ChatContext {
    let outcome = manager.run_pipeline(event, ctx).await;
    for failure in outcome.failures() {
        eprintln!(
            "  [{}] {} failed: {}",
            event,
            failure.plugin,
            failure.result.error().unwrap_or("unknown error")
        );
    }
    outcome.context
}

pub(crate) async fn cmd_run(
    config: Option<PathBuf>,
    message: String,
    backend: Option<String>,
    model: String,
) -> Result<()> {
    let (_, loaded) = load_config(config.as_deref())?;
    let (manager, _) = start_manager(&loaded).await?;

    let ctx = ChatContext::from_user(model, message);
    let result = exchange(&manager, ctx, backend.as_deref()).await;
    manager.shutdown().await;

    let ctx = result?;
    if let Some(reply) = ctx.last_message() {
        println!("{}", reply.content);
    }
    Ok(())
}
