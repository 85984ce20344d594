//! Named extension points.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An event type plugins can attach callbacks to.
///
/// The first four are *transform* events: each stage's output feeds the next
/// stage. The rest are *notify* events: every stage sees the same input and
/// stages may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookEvent {
    BeforeMessage,
    AfterMessage,
    BeforeRequest,
    AfterResponse,
    RequestStarted,
    RequestCompleted,
    BeforeModelLoad,
    AfterModelLoad,
    OnError,
    /// A user-defined event, serialized as `custom:<name>`.
    Custom(String),
}

impl HookEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::BeforeMessage => "before_message",
            Self::AfterMessage => "after_message",
            Self::BeforeRequest => "before_request",
            Self::AfterResponse => "after_response",
            Self::RequestStarted => "request_started",
            Self::RequestCompleted => "request_completed",
            Self::BeforeModelLoad => "before_model_load",
            Self::AfterModelLoad => "after_model_load",
            Self::OnError => "on_error",
            Self::Custom(name) => name,
        }
    }

    /// Whether stages of this event chain their outputs.
    pub fn is_transform(&self) -> bool {
        matches!(
            self,
            Self::BeforeMessage | Self::AfterMessage | Self::BeforeRequest | Self::AfterResponse
        )
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(name) => write!(f, "custom:{}", name),
            other => f.write_str(other.name()),
        }
    }
}

/// `beforeMessage` -> `before_message`.
fn to_snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, ch) in s.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else if ch == '-' {
            out.push('_');
        } else {
            out.push(ch);
        }
    }
    out
}

impl HookEvent {
    /// Known names parse in snake_case or camelCase; anything else becomes
    /// `Custom` (with an optional `custom:` prefix stripped).
    pub fn from_name(s: &str) -> Self {
        let trimmed = s.trim();
        if let Some(custom) = trimmed.strip_prefix("custom:") {
            return Self::Custom(custom.to_string());
        }
        match to_snake_case(trimmed).as_str() {
            "before_message" => Self::BeforeMessage,
            "after_message" => Self::AfterMessage,
            "before_request" => Self::BeforeRequest,
            "after_response" => Self::AfterResponse,
            "request_started" => Self::RequestStarted,
            "request_completed" => Self::RequestCompleted,
            "before_model_load" => Self::BeforeModelLoad,
            "after_model_load" => Self::AfterModelLoad,
            "on_error" => Self::OnError,
            _ => Self::Custom(trimmed.to_string()),
        }
    }
}

impl FromStr for HookEvent {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl Serialize for HookEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HookEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_name(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snake_and_camel() {
        assert_eq!(
            "before_message".parse::<HookEvent>().unwrap(),
            HookEvent::BeforeMessage
        );
        assert_eq!(
            "beforeModelLoad".parse::<HookEvent>().unwrap(),
            HookEvent::BeforeModelLoad
        );
        assert_eq!(
            "after-response".parse::<HookEvent>().unwrap(),
            HookEvent::AfterResponse
        );
    }

    #[test]
    fn test_unknown_is_custom() {
        assert_eq!(
            "custom:audit".parse::<HookEvent>().unwrap(),
            HookEvent::Custom("audit".into())
        );
        assert_eq!(
            "audit".parse::<HookEvent>().unwrap(),
            HookEvent::Custom("audit".into())
        );
    }

    #[test]
    fn test_display_and_serde() {
        assert_eq!(HookEvent::AfterMessage.to_string(), "after_message");
        assert_eq!(HookEvent::Custom("x".into()).to_string(), "custom:x");

        let json = serde_json::to_string(&HookEvent::Custom("x".into())).unwrap();
        assert_eq!(json, "\"custom:x\"");
        let back: HookEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, HookEvent::Custom("x".into()));
    }

    #[test]
    fn test_transform_classification() {
        assert!(HookEvent::BeforeMessage.is_transform());
        assert!(HookEvent::AfterResponse.is_transform());
        assert!(!HookEvent::RequestStarted.is_transform());
        assert!(!HookEvent::Custom("x".into()).is_transform());
    }
}
