//! # Observability
//!
//! Structured logging through `tracing` and request/backend/session metrics
//! through the `metrics` facade with an optional Prometheus exporter.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::install_prometheus;
