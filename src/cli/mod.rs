//! CLI command handlers.

mod common;
pub(crate) mod metrics;
pub(crate) mod run;
pub(crate) mod status;
pub(crate) mod watch;
