//! Request tracer middleware.
//!
//! Stamps each request with a UUID (`request_id` by default, see the
//! `field` setting) and its start time, then copies the id onto the reply.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::plugins::{Capability, Middleware, Plugin, PluginConfig, PluginMetadata, PluginResult};
use crate::session::{Message, Metadata};

pub const FACTORY: &str = "request-tracer";
const DEFAULT_FIELD: &str = "request_id";
const STARTED_FIELD: &str = "request_started_at";

pub struct RequestTracer {
    meta: PluginMetadata,
    field: RwLock<String>,
}

impl RequestTracer {
    pub fn new(name: &str) -> Self {
        Self {
            meta: PluginMetadata::new(name, env!("CARGO_PKG_VERSION"), Capability::Middleware)
                .with_description("Tags requests and replies with a request id"),
            field: RwLock::new(DEFAULT_FIELD.to_string()),
        }
    }

    fn field(&self) -> String {
        self.field.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Plugin for RequestTracer {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }

    async fn initialize(&self, config: &PluginConfig) -> PluginResult<()> {
        let field = config.setting_str("field").unwrap_or(DEFAULT_FIELD).trim();
        if field.is_empty() {
            return PluginResult::fail("setting 'field' must not be empty");
        }
        *self.field.write().unwrap_or_else(|e| e.into_inner()) = field.to_string();
        PluginResult::ok(())
    }

    fn as_middleware(self: Arc<Self>) -> Option<Arc<dyn Middleware>> {
        Some(self)
    }
}

#[async_trait]
impl Middleware for RequestTracer {
    async fn before_request(&self, mut request: Metadata) -> PluginResult<Metadata> {
        let field = self.field();
        if !request.contains_key(&field) {
            let id = Uuid::new_v4().to_string();
            debug!(plugin = %self.meta.name, request_id = %id, "Tagged request");
            request.insert(field, Value::String(id));
        }
        request
            .entry(STARTED_FIELD)
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        PluginResult::ok(request)
    }

    async fn after_response(&self, request: &Metadata, response: Message) -> PluginResult<Message> {
        let field = self.field();
        let Some(id) = request.get(&field) else {
            return PluginResult::ok(response);
        };
        let mut reply = response.with_metadata(&field, id.clone());

        let started = request
            .get(STARTED_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
        if let Some(started) = started {
            let elapsed = Utc::now().signed_duration_since(started.with_timezone(&Utc));
            reply = reply.with_metadata("latency_ms", Value::from(elapsed.num_milliseconds()));
        }
        PluginResult::ok(reply)
    }
}
