//! Message logger: records every message that passes through a pipeline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::hooks::HookEvent;
use crate::plugins::{
    Capability, HealthStatus, MessageProcessor, Plugin, PluginConfig, PluginMetadata,
    PluginResult,
};
use crate::session::{ChatContext, Message};

pub const FACTORY: &str = "message-logger";

/// Longest content preview written to the log.
const PREVIEW_CHARS: usize = 80;

pub struct MessageLogger {
    meta: PluginMetadata,
    seen: AtomicU64,
    verbose: AtomicBool,
}

impl MessageLogger {
    pub fn new(name: &str) -> Self {
        Self {
            meta: PluginMetadata::new(name, env!("CARGO_PKG_VERSION"), Capability::MessageProcessor)
                .with_description("Logs messages passing through the pipeline")
                .with_tags(["observability"]),
            seen: AtomicU64::new(0),
            verbose: AtomicBool::new(false),
        }
    }

    /// Messages logged since initialization.
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[async_trait]
impl Plugin for MessageLogger {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }

    async fn initialize(&self, config: &PluginConfig) -> PluginResult<()> {
        let verbose = config.setting_str("level") == Some("debug")
            || config.setting_bool("verbose") == Some(true);
        self.verbose.store(verbose, Ordering::Relaxed);
        self.seen.store(0, Ordering::Relaxed);
        PluginResult::ok(())
    }

    async fn health_check(&self) -> PluginResult<HealthStatus> {
        PluginResult::ok(HealthStatus::Healthy).with_metadata("seen", Value::from(self.seen()))
    }

    fn as_message_processor(self: Arc<Self>) -> Option<Arc<dyn MessageProcessor>> {
        Some(self)
    }
}

#[async_trait]
impl MessageProcessor for MessageLogger {
    async fn process_message(&self, message: Message, context: &ChatContext) -> PluginResult<Message> {
        let n = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        if self.verbose.load(Ordering::Relaxed) {
            debug!(
                plugin = %self.meta.name,
                role = %message.role,
                model = context.model(),
                content = %preview(&message.content),
                "Message"
            );
        } else {
            info!(
                plugin = %self.meta.name,
                role = %message.role,
                model = context.model(),
                chars = message.content.chars().count(),
                seq = n,
                "Message"
            );
        }
        PluginResult::ok(message)
    }

    fn events(&self) -> Vec<HookEvent> {
        vec![HookEvent::BeforeMessage, HookEvent::AfterMessage]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passes_message_through_and_counts() {
        let logger = MessageLogger::new("logger");
        assert!(logger.initialize(&PluginConfig::named("logger")).await.is_ok());

        let ctx = ChatContext::from_user("m", "hello");
        let msg = Message::user("hello");
        let out = logger.process_message(msg.clone(), &ctx).await;
        assert_eq!(out.into_data(), Some(msg));
        logger.process_message(Message::assistant("hi"), &ctx).await;
        assert_eq!(logger.seen(), 2);

        let health = logger.health_check().await;
        assert_eq!(health.metadata()["seen"], 2);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(PREVIEW_CHARS + 5);
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
        assert_eq!(preview("short"), "short");
    }
}
