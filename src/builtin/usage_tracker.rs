//! Usage tracker extension.
//!
//! Counts requests (`request_started`) and messages/tokens
//! (`after_message`) per model. With a `token_budget` setting, health turns
//! `degraded` once the budget is spent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::hooks::HookEvent;
use crate::plugins::{
    Capability, FeatureExtension, HealthStatus, Plugin, PluginConfig, PluginMetadata,
    PluginResult,
};
use crate::session::{ChatContext, Message};

pub const FACTORY: &str = "usage-tracker";

/// Per-model counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub requests: u64,
    pub messages: u64,
    pub tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub models: BTreeMap<String, ModelUsage>,
    pub total_tokens: u64,
    pub token_budget: Option<u64>,
}

#[derive(Default)]
struct UsageState {
    models: BTreeMap<String, ModelUsage>,
    budget: Option<u64>,
    warned: bool,
}

pub struct UsageTracker {
    meta: PluginMetadata,
    state: Mutex<UsageState>,
}

/// Reported token count, or a whitespace word count when absent.
fn estimate_tokens(message: &Message) -> u64 {
    message
        .token_count
        .map(u64::from)
        .unwrap_or_else(|| message.content.split_whitespace().count() as u64)
}

impl UsageTracker {
    pub fn new(name: &str) -> Self {
        Self {
            meta: PluginMetadata::new(name, env!("CARGO_PKG_VERSION"), Capability::Extension)
                .with_description("Counts requests, messages and tokens per model")
                .with_tags(["observability", "usage"]),
            state: Mutex::new(UsageState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UsageState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let state = self.lock();
        UsageSnapshot {
            models: state.models.clone(),
            total_tokens: state.models.values().map(|m| m.tokens).sum(),
            token_budget: state.budget,
        }
    }
}

#[async_trait]
impl Plugin for UsageTracker {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }

    async fn initialize(&self, config: &PluginConfig) -> PluginResult<()> {
        let budget = match config.settings.get("token_budget") {
            None | Some(Value::Null) => None,
            Some(_) => match config.setting_u64("token_budget") {
                Some(n) => Some(n),
                None => return PluginResult::fail("token_budget must be a non-negative integer"),
            },
        };
        let mut state = self.lock();
        state.budget = budget;
        state.warned = false;
        PluginResult::ok(())
    }

    async fn health_check(&self) -> PluginResult<HealthStatus> {
        let snapshot = self.snapshot();
        let status = match snapshot.token_budget {
            Some(budget) if snapshot.total_tokens >= budget => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        };
        PluginResult::ok(status).with_metadata("total_tokens", Value::from(snapshot.total_tokens))
    }

    fn as_extension(self: Arc<Self>) -> Option<Arc<dyn FeatureExtension>> {
        Some(self)
    }
}

#[async_trait]
impl FeatureExtension for UsageTracker {
    fn hook_events(&self) -> Vec<HookEvent> {
        vec![HookEvent::RequestStarted, HookEvent::AfterMessage]
    }

    async fn on_event(&self, event: &HookEvent, context: ChatContext) -> PluginResult<ChatContext> {
        let model = context.model().to_string();
        let mut state = self.lock();
        match event {
            HookEvent::RequestStarted => {
                state.models.entry(model).or_default().requests += 1;
                drop(state);
                PluginResult::ok(context)
            }
            HookEvent::AfterMessage => {
                let tokens = context.last_message().map(estimate_tokens).unwrap_or(0);
                let usage = state.models.entry(model).or_default();
                usage.messages += 1;
                usage.tokens += tokens;

                let total: u64 = state.models.values().map(|m| m.tokens).sum();
                if let Some(budget) = state.budget {
                    if total >= budget && !state.warned {
                        state.warned = true;
                        warn!(plugin = %self.meta.name, total = total, budget = budget, "Token budget exhausted");
                    }
                }
                drop(state);
                PluginResult::ok(context.with_metadata_entry("usage_total_tokens", Value::from(total)))
            }
            _ => PluginResult::ok(context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_counts_requests_and_tokens() {
        let tracker = UsageTracker::new("usage");
        let ctx = ChatContext::from_user("m1", "one two three");

        tracker.on_event(&HookEvent::RequestStarted, ctx.clone()).await;
        let out = tracker
            .on_event(&HookEvent::AfterMessage, ctx.clone())
            .await
            .into_data()
            .unwrap();
        assert_eq!(out.metadata()["usage_total_tokens"], 3);

        let reply = ctx.append(Message::assistant("x").with_token_count(10));
        tracker.on_event(&HookEvent::AfterMessage, reply).await;

        let snap = tracker.snapshot();
        let m1 = &snap.models["m1"];
        assert_eq!(m1.requests, 1);
        assert_eq!(m1.messages, 2);
        assert_eq!(m1.tokens, 13);
        assert_eq!(snap.total_tokens, 13);
    }

    #[tokio::test]
    async fn test_budget_degrades_health() {
        let tracker = UsageTracker::new("usage");
        let config = PluginConfig::named("usage").with_setting("token_budget", json!(2));
        assert!(tracker.initialize(&config).await.is_ok());
        assert_eq!(tracker.health_check().await.data(), Some(&HealthStatus::Healthy));

        tracker
            .on_event(&HookEvent::AfterMessage, ChatContext::from_user("m", "a b c"))
            .await;
        assert_eq!(tracker.health_check().await.data(), Some(&HealthStatus::Degraded));
    }

    #[tokio::test]
    async fn test_budget_from_env_string() {
        let tracker = UsageTracker::new("usage");
        let config = PluginConfig::named("usage").with_setting("token_budget", json!("1"));
        assert!(tracker.initialize(&config).await.is_ok());
        assert_eq!(tracker.snapshot().token_budget, Some(1));
    }

    #[tokio::test]
    async fn test_invalid_budget_fails_init() {
        let tracker = UsageTracker::new("usage");
        let config = PluginConfig::named("usage").with_setting("token_budget", json!("lots"));
        assert!(tracker.initialize(&config).await.is_fail());
    }

    #[tokio::test]
    async fn test_unrelated_event_is_noop() {
        let tracker = UsageTracker::new("usage");
        let ctx = ChatContext::from_user("m", "hi");
        let out = tracker.on_event(&HookEvent::OnError, ctx.clone()).await;
        assert_eq!(out.into_data(), Some(ctx));
        assert!(tracker.snapshot().models.is_empty());
    }
}
