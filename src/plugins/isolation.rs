//! The boundary between untrusted plugin futures and the core.
//!
//! Everything the core awaits on behalf of a plugin goes through
//! [`isolate`]: the future runs under a timeout, panics are caught and
//! turned into `Fail`, and the wall-clock time is stamped on the result.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tracing::warn;

use super::result::{PluginResult, ERROR_KIND_KEY};

/// Error text of a timed-out call.
pub const TIMEOUT_ERROR: &str = "timeout";

/// Run a plugin future with a time budget and panic capture.
///
/// On timeout the future is dropped and its eventual output ignored.
pub async fn isolate<T, F>(plugin: &str, timeout: Duration, fut: F) -> PluginResult<T>
where
    F: Future<Output = PluginResult<T>>,
{
    let started = Instant::now();
    let guarded = AssertUnwindSafe(fut).catch_unwind();

    let result = match tokio::time::timeout(timeout, guarded).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            warn!(plugin = plugin, error = %message, "Plugin call panicked");
            PluginResult::fail(message).with_metadata(ERROR_KIND_KEY, Value::from("panic"))
        }
        Err(_) => {
            warn!(
                plugin = plugin,
                timeout_ms = timeout.as_millis() as u64,
                "Plugin call timed out"
            );
            PluginResult::fail(TIMEOUT_ERROR).with_metadata(ERROR_KIND_KEY, Value::from("timeout"))
        }
    };

    result.with_elapsed(started.elapsed())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "plugin panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passes_through_ok() {
        let result = isolate("p", Duration::from_secs(1), async { PluginResult::ok(7) }).await;
        assert_eq!(result.data(), Some(&7));
    }

    #[tokio::test]
    async fn test_timeout_becomes_fail() {
        let result: PluginResult<()> = isolate("slow", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            PluginResult::ok(())
        })
        .await;
        assert_eq!(result.error(), Some(TIMEOUT_ERROR));
        assert_eq!(result.error_kind(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_panic_becomes_fail_with_message() {
        let explode = true;
        let result: PluginResult<()> = isolate("bad", Duration::from_secs(1), async move {
            if explode {
                panic!("exploded in plugin");
            }
            PluginResult::ok(())
        })
        .await;
        assert_eq!(result.error(), Some("exploded in plugin"));
        assert_eq!(result.error_kind(), Some("panic"));
    }

    #[tokio::test]
    async fn test_elapsed_is_stamped() {
        let result = isolate("p", Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            PluginResult::ok(())
        })
        .await;
        assert!(result.elapsed() >= Duration::from_millis(10));
    }
}
