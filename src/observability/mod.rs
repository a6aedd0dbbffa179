//! Observability infrastructure.
//!
//! Provides:
//! - Structured logging via `tracing`
//! - OpenTelemetry metrics for credit, message and cancellation counts

pub mod metrics;
pub mod tracing;
