//! Echo backend: replies with the last user message.
//!
//! Useful for wiring tests and for `chatplug run` without a real model.
//! Settings: `prefix` (default `"echo: "`), `models` (default `["echo"]`).

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::plugins::{
    BackendProvider, Capability, Plugin, PluginConfig, PluginMetadata, PluginResult,
};
use crate::session::{ChatContext, Message, Role};

pub const FACTORY: &str = "echo-backend";
const DEFAULT_PREFIX: &str = "echo: ";

#[derive(Debug, Clone)]
struct EchoSettings {
    prefix: String,
    models: Vec<String>,
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            models: vec!["echo".to_string()],
        }
    }
}

pub struct EchoBackend {
    meta: PluginMetadata,
    settings: RwLock<EchoSettings>,
}

impl EchoBackend {
    pub fn new(name: &str) -> Self {
        Self {
            meta: PluginMetadata::new(name, env!("CARGO_PKG_VERSION"), Capability::Backend)
                .with_description("Echoes the last user message back"),
            settings: RwLock::new(EchoSettings::default()),
        }
    }

    fn settings(&self) -> EchoSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Plugin for EchoBackend {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }

    async fn initialize(&self, config: &PluginConfig) -> PluginResult<()> {
        let mut settings = EchoSettings::default();
        if let Some(prefix) = config.setting_str("prefix") {
            settings.prefix = prefix.to_string();
        }
        let models = config.setting_str_list("models");
        if !models.is_empty() {
            settings.models = models;
        }
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        PluginResult::ok(())
    }

    fn as_backend(self: Arc<Self>) -> Option<Arc<dyn BackendProvider>> {
        Some(self)
    }
}

#[async_trait]
impl BackendProvider for EchoBackend {
    async fn chat(&self, context: &ChatContext) -> PluginResult<Message> {
        let Some(last) = context
            .messages()
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
        else {
            return PluginResult::fail("no user message to echo");
        };
        let settings = self.settings();
        let content = format!("{}{}", settings.prefix, last.content);
        let tokens = content.split_whitespace().count() as u32;
        PluginResult::ok(
            Message::assistant(content)
                .with_model(context.model())
                .with_token_count(tokens),
        )
    }

    async fn list_models(&self) -> PluginResult<Vec<String>> {
        PluginResult::ok(self.settings().models)
    }
}
