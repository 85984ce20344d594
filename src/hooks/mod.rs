//! Hook system for chatplug pipelines.
//!
//! Plugins attach callbacks to named events ([`HookEvent`]). The
//! [`HookManager`] keeps one ordered list per event and runs it either as a
//! transform pipeline (each stage rewrites the context) or as a notify
//! pipeline (every stage sees the same input).
//!
//! Each `(event, plugin)` pair has its own [`CircuitBreaker`], optional rate
//! window and running metrics. All callbacks share one concurrency gate.
//!
//! # Example
//!
//! ```rust
//! use chatplug::hooks::{callback, HookEvent, HookManager};
//! use chatplug::plugins::PluginResult;
//! use chatplug::session::{ChatContext, Message};
//!
//! # tokio_test::block_on(async {
//! let hooks = HookManager::default();
//! hooks.register_hook(
//!     HookEvent::BeforeMessage,
//!     "shout",
//!     callback(|ctx: ChatContext| async move {
//!         let last = ctx.last_message().cloned().unwrap_or_else(|| Message::user(""));
//!         PluginResult::ok(ctx.replace_last(last.with_content(last.content.to_uppercase())))
//!     }),
//!     10,
//! );
//!
//! let outcome = hooks
//!     .execute_hooks(&HookEvent::BeforeMessage, ChatContext::from_user("m", "hi"), false)
//!     .await;
//! assert!(outcome.success());
//! assert_eq!(outcome.context.last_message().unwrap().content, "HI");
//! # });
//! ```

pub mod circuit;
pub mod event;
pub mod manager;
pub mod metrics;
pub mod rate_limit;

pub use circuit::{
    BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState, Clock, ManualClock, Permit,
    SystemClock,
};
pub use event::HookEvent;
pub use manager::{
    callback, HookCallback, HookExecution, HookManager, HookManagerConfig, HookRegistration,
    HookSpec, PipelineMode, PipelineOptions, PipelineOutcome, BREAKER_OPEN_ERROR,
    RATE_LIMITED_ERROR,
};
pub use metrics::{HookMetrics, HookMetricsSnapshot};
pub use rate_limit::RateWindow;
