//! Content filter: masks blocked terms in messages.
//!
//! Settings:
//! - `blocked_terms`: list of terms to mask (or a comma-separated string)
//! - `replacement`: mask text, default `***`
//! - `case_sensitive`: default `false`

use std::sync::{Arc, RwLock};

use aho_corasick::{AhoCorasick, MatchKind};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::hooks::HookEvent;
use crate::plugins::{
    Capability, MessageProcessor, Plugin, PluginConfig, PluginMetadata, PluginResult,
};
use crate::session::{ChatContext, Message};

pub const FACTORY: &str = "content-filter";
const DEFAULT_REPLACEMENT: &str = "***";

struct Filter {
    matcher: AhoCorasick,
    replacement: String,
}

impl Filter {
    /// Masked copy of `text` and the number of matches.
    fn apply(&self, text: &str) -> (String, usize) {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        let mut hits = 0;
        for m in self.matcher.find_iter(text) {
            out.push_str(&text[last..m.start()]);
            out.push_str(&self.replacement);
            last = m.end();
            hits += 1;
        }
        out.push_str(&text[last..]);
        (out, hits)
    }
}

pub struct ContentFilter {
    meta: PluginMetadata,
    filter: RwLock<Option<Arc<Filter>>>,
}

impl ContentFilter {
    pub fn new(name: &str) -> Self {
        Self {
            meta: PluginMetadata::new(name, env!("CARGO_PKG_VERSION"), Capability::MessageProcessor)
                .with_description("Masks blocked terms in user and assistant messages")
                .with_tags(["safety", "filter"]),
            filter: RwLock::new(None),
        }
    }

    fn current(&self) -> Option<Arc<Filter>> {
        self.filter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Plugin for ContentFilter {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }

    async fn initialize(&self, config: &PluginConfig) -> PluginResult<()> {
        let terms: Vec<String> = config
            .setting_str_list("blocked_terms")
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let replacement = config
            .setting_str("replacement")
            .unwrap_or(DEFAULT_REPLACEMENT)
            .to_string();
        let case_sensitive = config.setting_bool("case_sensitive").unwrap_or(false);

        let filter = if terms.is_empty() {
            None
        } else {
            let matcher = match AhoCorasick::builder()
                .ascii_case_insensitive(!case_sensitive)
                .match_kind(MatchKind::LeftmostLongest)
                .build(&terms)
            {
                Ok(m) => m,
                Err(e) => return PluginResult::fail(format!("invalid blocked_terms: {}", e)),
            };
            Some(Arc::new(Filter {
                matcher,
                replacement,
            }))
        };

        debug!(plugin = %self.meta.name, terms = terms.len(), "Content filter configured");
        *self.filter.write().unwrap_or_else(|e| e.into_inner()) = filter;
        PluginResult::ok(()).with_metadata("terms", Value::from(terms.len()))
    }

    fn as_message_processor(self: Arc<Self>) -> Option<Arc<dyn MessageProcessor>> {
        Some(self)
    }
}

#[async_trait]
impl MessageProcessor for ContentFilter {
    async fn process_message(
        &self,
        message: Message,
        _context: &ChatContext,
    ) -> PluginResult<Message> {
        let Some(filter) = self.current() else {
            return PluginResult::ok(message);
        };
        let (masked, hits) = filter.apply(&message.content);
        if hits == 0 {
            return PluginResult::ok(message);
        }
        debug!(plugin = %self.meta.name, hits = hits, "Masked blocked terms");
        PluginResult::ok(
            message
                .with_content(masked)
                .with_metadata("filtered_terms", Value::from(hits)),
        )
        .with_metadata("filtered_terms", Value::from(hits))
    }

    fn events(&self) -> Vec<HookEvent> {
        vec![HookEvent::BeforeMessage, HookEvent::AfterResponse]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn filter_with(settings: Value) -> ContentFilter {
        let plugin = ContentFilter::new("contentFilter");
        let mut config = PluginConfig::named("contentFilter");
        config.settings = settings.as_object().cloned().unwrap_or_default();
        assert!(plugin.initialize(&config).await.is_ok());
        plugin
    }

    #[tokio::test]
    async fn test_masks_terms_case_insensitively() {
        let plugin = filter_with(json!({ "blocked_terms": ["darn", "heck"] })).await;
        let ctx = ChatContext::new("m");
        let out = plugin
            .process_message(Message::user("Darn it, what the HECK"), &ctx)
            .await;
        let message = out.into_data().unwrap();
        assert_eq!(message.content, "*** it, what the ***");
        assert_eq!(message.metadata["filtered_terms"], 2);
    }

    #[tokio::test]
    async fn test_longest_match_wins() {
        let plugin = filter_with(json!({
            "blocked_terms": ["pass", "password"],
            "replacement": "[redacted]"
        }))
        .await;
        let out = plugin
            .process_message(Message::user("my password is"), &ChatContext::new("m"))
            .await;
        assert_eq!(out.into_data().unwrap().content, "my [redacted] is");
    }

    #[tokio::test]
    async fn test_case_sensitive_setting() {
        let plugin = filter_with(json!({ "blocked_terms": "Secret", "case_sensitive": true })).await;
        let out = plugin
            .process_message(Message::user("secret Secret"), &ChatContext::new("m"))
            .await;
        assert_eq!(out.into_data().unwrap().content, "secret ***");
    }

    #[tokio::test]
    async fn test_no_terms_passes_through() {
        let plugin = filter_with(json!({})).await;
        let original = Message::user("anything goes");
        let out = plugin
            .process_message(original.clone(), &ChatContext::new("m"))
            .await;
        assert_eq!(out.into_data().unwrap(), original);
    }
}
