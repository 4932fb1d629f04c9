//! Observability for Maestro: structured logging with optional
//! OpenTelemetry export of the `workflow.step` spans.

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};
