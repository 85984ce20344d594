//! The success/failure value returned by every plugin operation.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::error::PluginError;
use crate::session::Metadata;

/// Metadata key holding the machine-readable failure kind.
pub const ERROR_KIND_KEY: &str = "error_kind";

/// Outcome of a plugin operation.
///
/// Plugins never signal failure by panicking or by returning
/// [`PluginError`]; they return `Fail`. `map` and `flat_map` only touch
/// the `Ok` payload and pass a `Fail` through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PluginResult<T> {
    Ok {
        data: T,
        metadata: Metadata,
        elapsed: Duration,
    },
    Fail {
        error: String,
        metadata: Metadata,
        elapsed: Duration,
    },
}

impl<T> PluginResult<T> {
    pub fn ok(data: T) -> Self {
        Self::Ok {
            data,
            metadata: Metadata::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self::Fail {
            error: error.into(),
            metadata: Metadata::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// `Fail` carrying the error's message and its kind in metadata.
    pub fn from_error(err: &PluginError) -> Self {
        Self::fail(err.to_string()).with_metadata(ERROR_KIND_KEY, Value::from(err.kind()))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn is_fail(&self) -> bool {
        !self.is_ok()
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Ok { data, .. } => Some(data),
            Self::Fail { .. } => None,
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            Self::Ok { data, .. } => Some(data),
            Self::Fail { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Ok { .. } => None,
            Self::Fail { error, .. } => Some(error),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Self::Ok { metadata, .. } | Self::Fail { metadata, .. } => metadata,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Ok { elapsed, .. } | Self::Fail { elapsed, .. } => *elapsed,
        }
    }

    /// The `error_kind` metadata entry, if any.
    pub fn error_kind(&self) -> Option<&str> {
        self.metadata().get(ERROR_KIND_KEY).and_then(Value::as_str)
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        match &mut self {
            Self::Ok { metadata, .. } | Self::Fail { metadata, .. } => {
                metadata.insert(key.to_string(), value);
            }
        }
        self
    }

    pub fn with_elapsed(mut self, duration: Duration) -> Self {
        match &mut self {
            Self::Ok { elapsed, .. } | Self::Fail { elapsed, .. } => *elapsed = duration,
        }
        self
    }

    /// Transform the success payload.
    pub fn map<U, F>(self, f: F) -> PluginResult<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Ok {
                data,
                metadata,
                elapsed,
            } => PluginResult::Ok {
                data: f(data),
                metadata,
                elapsed,
            },
            Self::Fail {
                error,
                metadata,
                elapsed,
            } => PluginResult::Fail {
                error,
                metadata,
                elapsed,
            },
        }
    }

    /// Chain another result-producing step. Metadata from both steps is
    /// merged and elapsed times are summed.
    pub fn flat_map<U, F>(self, f: F) -> PluginResult<U>
    where
        F: FnOnce(T) -> PluginResult<U>,
    {
        match self {
            Self::Ok {
                data,
                metadata,
                elapsed,
            } => {
                let mut next = f(data);
                match &mut next {
                    PluginResult::Ok {
                        metadata: m,
                        elapsed: e,
                        ..
                    }
                    | PluginResult::Fail {
                        metadata: m,
                        elapsed: e,
                        ..
                    } => {
                        for (k, v) in metadata {
                            m.entry(k).or_insert(v);
                        }
                        *e += elapsed;
                    }
                }
                next
            }
            Self::Fail {
                error,
                metadata,
                elapsed,
            } => PluginResult::Fail {
                error,
                metadata,
                elapsed,
            },
        }
    }

    /// Convert into a `std::result::Result`, dropping metadata.
    pub fn into_result(self) -> std::result::Result<T, String> {
        match self {
            Self::Ok { data, .. } => Ok(data),
            Self::Fail { error, .. } => Err(error),
        }
    }
}

impl<T> From<std::result::Result<T, PluginError>> for PluginResult<T> {
    fn from(result: std::result::Result<T, PluginError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::from_error(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_on_ok() {
        assert_eq!(PluginResult::ok(5).map(|x| x + 1), PluginResult::ok(6));
    }

    #[test]
    fn test_map_on_fail_is_identity() {
        let failed: PluginResult<i32> = PluginResult::fail("e");
        assert_eq!(failed.clone().map(|x| x + 1), PluginResult::fail("e"));
        assert_eq!(failed.map(|x| x.to_string()), PluginResult::fail("e"));
    }

    #[test]
    fn test_flat_map_chains_only_on_ok() {
        let chained = PluginResult::ok(2)
            .flat_map(|x| PluginResult::ok(x * 10))
            .flat_map(|x| PluginResult::ok(x + 1));
        assert_eq!(chained.data(), Some(&21));
    }

    #[test]
    fn test_flat_map_short_circuits_on_first_fail() {
        let mut third_called = false;
        let result = PluginResult::ok(1)
            .flat_map(|_| PluginResult::<i32>::fail("first"))
            .flat_map(|x| {
                third_called = true;
                PluginResult::ok(x)
            });
        assert!(!third_called);
        assert_eq!(result.error(), Some("first"));
    }

    #[test]
    fn test_flat_map_merges_metadata_and_elapsed() {
        let result = PluginResult::ok(1)
            .with_metadata("a", json!(1))
            .with_elapsed(Duration::from_millis(5))
            .flat_map(|x| {
                PluginResult::ok(x)
                    .with_metadata("b", json!(2))
                    .with_elapsed(Duration::from_millis(7))
            });
        assert_eq!(result.metadata().len(), 2);
        assert_eq!(result.elapsed(), Duration::from_millis(12));
    }

    #[test]
    fn test_from_error_records_kind() {
        let err = PluginError::Timeout {
            plugin: "slow".into(),
            timeout: Duration::from_secs(1),
        };
        let result: PluginResult<()> = PluginResult::from_error(&err);
        assert!(result.is_fail());
        assert_eq!(result.error_kind(), Some("timeout"));
    }

    #[test]
    fn test_into_result() {
        assert_eq!(PluginResult::ok(3).into_result(), Ok(3));
        assert_eq!(
            PluginResult::<i32>::fail("boom").into_result(),
            Err("boom".to_string())
        );
    }

    #[test]
    fn test_serialize_tagged() {
        let value = serde_json::to_value(PluginResult::<i32>::fail("x")).unwrap();
        assert_eq!(value["status"], json!("fail"));
        assert_eq!(value["error"], json!("x"));
    }
}
