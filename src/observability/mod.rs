//! # Observability
//!
//! Prometheus metrics collection. Logging goes through `tracing` and is set up
//! at process startup.

pub mod metrics;

// Re-export for convenience
pub use metrics::*;
