//! Plugin and capability traits.
//!
//! A plugin is any `Plugin` implementation. What it can *do* is decided by
//! which capability views it hands out: a plugin that returns
//! `Some(self)` from [`Plugin::as_backend`] is a backend, regardless of what
//! else it is. Views are checked one by one; there is no base-class chain.

use std::sync::Arc;

use async_trait::async_trait;

use crate::hooks::HookEvent;
use crate::session::{ChatContext, Message, Metadata};

use super::result::PluginResult;
use super::types::{Capability, HealthStatus, PluginConfig, PluginMetadata};

/// The lifecycle surface every plugin exposes.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Identity of this plugin instance.
    fn metadata(&self) -> &PluginMetadata;

    /// Prepare the plugin using its configuration. Called on load and on
    /// every manual retry.
    async fn initialize(&self, config: &PluginConfig) -> PluginResult<()>;

    /// Release resources. Failures are logged by the manager, never fatal.
    async fn shutdown(&self) -> PluginResult<()> {
        PluginResult::ok(())
    }

    async fn health_check(&self) -> PluginResult<HealthStatus> {
        PluginResult::ok(HealthStatus::Healthy)
    }

    fn as_message_processor(self: Arc<Self>) -> Option<Arc<dyn MessageProcessor>> {
        None
    }

    fn as_backend(self: Arc<Self>) -> Option<Arc<dyn BackendProvider>> {
        None
    }

    fn as_extension(self: Arc<Self>) -> Option<Arc<dyn FeatureExtension>> {
        None
    }

    fn as_middleware(self: Arc<Self>) -> Option<Arc<dyn Middleware>> {
        None
    }
}

/// Transforms one message of a conversation.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Receives the last message of `context` and returns its replacement.
    async fn process_message(&self, message: Message, context: &ChatContext)
        -> PluginResult<Message>;

    /// Events this processor is attached to.
    fn events(&self) -> Vec<HookEvent> {
        vec![HookEvent::BeforeMessage]
    }
}

/// A model backend that produces assistant replies.
#[async_trait]
pub trait BackendProvider: Send + Sync {
    async fn chat(&self, context: &ChatContext) -> PluginResult<Message>;

    async fn list_models(&self) -> PluginResult<Vec<String>>;
}

/// Arbitrary callbacks bound to named events.
#[async_trait]
pub trait FeatureExtension: Send + Sync {
    fn hook_events(&self) -> Vec<HookEvent>;

    async fn on_event(&self, event: &HookEvent, context: ChatContext) -> PluginResult<ChatContext>;
}

/// Wraps each request/response pair.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Inspect or amend the request metadata before the backend is called.
    async fn before_request(&self, request: Metadata) -> PluginResult<Metadata>;

    /// Inspect or amend the backend's reply.
    async fn after_response(&self, request: &Metadata, response: Message) -> PluginResult<Message>;
}

/// A plugin seen through one of its capabilities.
#[derive(Clone)]
pub enum CapabilityView {
    MessageProcessor(Arc<dyn MessageProcessor>),
    Backend(Arc<dyn BackendProvider>),
    Extension(Arc<dyn FeatureExtension>),
    Middleware(Arc<dyn Middleware>),
}

impl CapabilityView {
    pub fn capability(&self) -> Capability {
        match self {
            Self::MessageProcessor(_) => Capability::MessageProcessor,
            Self::Backend(_) => Capability::Backend,
            Self::Extension(_) => Capability::Extension,
            Self::Middleware(_) => Capability::Middleware,
        }
    }

    pub fn into_backend(self) -> Option<Arc<dyn BackendProvider>> {
        match self {
            Self::Backend(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_message_processor(self) -> Option<Arc<dyn MessageProcessor>> {
        match self {
            Self::MessageProcessor(p) => Some(p),
            _ => None,
        }
    }

    pub fn into_extension(self) -> Option<Arc<dyn FeatureExtension>> {
        match self {
            Self::Extension(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_middleware(self) -> Option<Arc<dyn Middleware>> {
        match self {
            Self::Middleware(m) => Some(m),
            _ => None,
        }
    }
}

impl std::fmt::Debug for CapabilityView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CapabilityView")
            .field(&self.capability())
            .finish()
    }
}

/// Cast `plugin` to the requested capability, if it exposes it.
pub fn view(plugin: &Arc<dyn Plugin>, capability: Capability) -> Option<CapabilityView> {
    let plugin = Arc::clone(plugin);
    match capability {
        Capability::MessageProcessor => plugin
            .as_message_processor()
            .map(CapabilityView::MessageProcessor),
        Capability::Backend => plugin.as_backend().map(CapabilityView::Backend),
        Capability::Extension => plugin.as_extension().map(CapabilityView::Extension),
        Capability::Middleware => plugin.as_middleware().map(CapabilityView::Middleware),
    }
}

/// Every capability `plugin` exposes, in [`Capability::ALL`] order.
pub fn capabilities_of(plugin: &Arc<dyn Plugin>) -> Vec<Capability> {
    Capability::ALL
        .into_iter()
        .filter(|cap| view(plugin, *cap).is_some())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare {
        meta: PluginMetadata,
    }

    #[async_trait]
    impl Plugin for Bare {
        fn metadata(&self) -> &PluginMetadata {
            &self.meta
        }

        async fn initialize(&self, _config: &PluginConfig) -> PluginResult<()> {
            PluginResult::ok(())
        }
    }

    struct Dual {
        meta: PluginMetadata,
    }

    #[async_trait]
    impl Plugin for Dual {
        fn metadata(&self) -> &PluginMetadata {
            &self.meta
        }

        async fn initialize(&self, _config: &PluginConfig) -> PluginResult<()> {
            PluginResult::ok(())
        }

        fn as_backend(self: Arc<Self>) -> Option<Arc<dyn BackendProvider>> {
            Some(self)
        }

        fn as_middleware(self: Arc<Self>) -> Option<Arc<dyn Middleware>> {
            Some(self)
        }
    }

    #[async_trait]
    impl BackendProvider for Dual {
        async fn chat(&self, context: &ChatContext) -> PluginResult<Message> {
            PluginResult::ok(Message::assistant(format!("{} messages", context.messages().len())))
        }

        async fn list_models(&self) -> PluginResult<Vec<String>> {
            PluginResult::ok(vec!["dual".into()])
        }
    }

    #[async_trait]
    impl Middleware for Dual {
        async fn before_request(&self, request: Metadata) -> PluginResult<Metadata> {
            PluginResult::ok(request)
        }

        async fn after_response(
            &self,
            _request: &Metadata,
            response: Message,
        ) -> PluginResult<Message> {
            PluginResult::ok(response)
        }
    }

    #[test]
    fn test_bare_plugin_has_no_capabilities() {
        let plugin: Arc<dyn Plugin> = Arc::new(Bare {
            meta: PluginMetadata::new("bare", "1.0.0", Capability::Extension),
        });
        assert!(capabilities_of(&plugin).is_empty());
        assert!(view(&plugin, Capability::Extension).is_none());
    }

    #[tokio::test]
    async fn test_each_view_checked_independently() {
        let plugin: Arc<dyn Plugin> = Arc::new(Dual {
            meta: PluginMetadata::new("dual", "1.0.0", Capability::Backend),
        });
        assert_eq!(
            capabilities_of(&plugin),
            vec![Capability::Backend, Capability::Middleware]
        );

        let backend = view(&plugin, Capability::Backend)
            .and_then(CapabilityView::into_backend)
            .unwrap();
        let reply = backend.chat(&ChatContext::from_user("m", "hi")).await;
        assert_eq!(reply.data().unwrap().content, "1 messages");

        assert!(view(&plugin, Capability::MessageProcessor).is_none());
        assert_eq!(
            view(&plugin, Capability::Middleware).unwrap().capability(),
            Capability::Middleware
        );
    }
}
