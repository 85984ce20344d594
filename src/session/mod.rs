//! Conversation records passed through plugin pipelines.
//!
//! [`Message`] and [`ChatContext`] are value types: every "mutation" returns
//! a new value, so a stage that fails in a pipeline can simply hand the
//! previous context on unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form key/value metadata carried by messages, contexts and results.
pub type Metadata = serde_json::Map<String, Value>;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
}

impl Message {
    /// Create a message with the current timestamp and no metadata.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            role,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
            model: None,
            token_count: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Copy of this message with different content; everything else is kept.
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..self.clone()
        }
    }

    /// Copy of this message with one extra metadata entry.
    pub fn with_metadata(&self, key: &str, value: Value) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.to_string(), value);
        next
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_token_count(mut self, tokens: u32) -> Self {
        self.token_count = Some(tokens);
        self
    }
}

/// An immutable view of a conversation plus generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatContext {
    messages: Vec<Message>,
    model: String,
    temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(default)]
    streaming: bool,
    #[serde(default)]
    metadata: Metadata,
}

impl ChatContext {
    /// Create an empty context for the given model (temperature 0.7).
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            streaming: false,
            metadata: Metadata::new(),
        }
    }

    /// Context holding a single user message.
    pub fn from_user(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(model).append(Message::user(content))
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// New context with `message` appended.
    pub fn append(&self, message: Message) -> Self {
        let mut next = self.clone();
        next.messages.push(message);
        next
    }

    /// New context with the last message replaced. Appends when empty.
    pub fn replace_last(&self, message: Message) -> Self {
        let mut next = self.clone();
        match next.messages.last_mut() {
            Some(last) => *last = message,
            None => next.messages.push(message),
        }
        next
    }

    /// New context with `metadata` replacing the current metadata map.
    pub fn with_metadata(&self, metadata: Metadata) -> Self {
        Self {
            metadata,
            ..self.clone()
        }
    }

    /// New context with one extra metadata entry.
    pub fn with_metadata_entry(&self, key: &str, value: Value) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.to_string(), value);
        next
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_returns_new_context() {
        let ctx = ChatContext::new("llama3");
        let next = ctx.append(Message::user("hello"));
        assert!(ctx.messages().is_empty());
        assert_eq!(next.messages().len(), 1);
        assert_eq!(next.last_message().unwrap().content, "hello");
    }

    #[test]
    fn test_replace_last() {
        let ctx = ChatContext::from_user("m", "hello").append(Message::user("world"));
        let next = ctx.replace_last(Message::user("there"));
        assert_eq!(next.messages().len(), 2);
        assert_eq!(next.messages()[0].content, "hello");
        assert_eq!(next.messages()[1].content, "there");
        assert_eq!(ctx.messages()[1].content, "world");
    }

    #[test]
    fn test_replace_last_on_empty_appends() {
        let ctx = ChatContext::new("m").replace_last(Message::user("x"));
        assert_eq!(ctx.messages().len(), 1);
    }

    #[test]
    fn test_metadata_entry() {
        let ctx = ChatContext::new("m").with_metadata_entry("request_id", json!("abc"));
        assert_eq!(ctx.metadata().get("request_id"), Some(&json!("abc")));
    }

    #[test]
    fn test_message_with_content_keeps_role_and_timestamp() {
        let msg = Message::assistant("hi").with_model("echo");
        let edited = msg.with_content("bye");
        assert_eq!(edited.role, Role::Assistant);
        assert_eq!(edited.timestamp, msg.timestamp);
        assert_eq!(edited.model.as_deref(), Some("echo"));
    }

    #[test]
    fn test_context_deserialize_defaults() {
        let ctx: ChatContext = serde_json::from_str(
            r#"{"messages": [], "model": "gpt", "temperature": 0.2}"#,
        )
        .unwrap();
        assert!(!ctx.is_streaming());
        assert!(ctx.max_tokens().is_none());
        assert!(ctx.metadata().is_empty());
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }
}
