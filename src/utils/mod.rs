//! Shared utilities.

pub mod lenient;
pub mod telemetry;
