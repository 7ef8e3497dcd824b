//! Shared configuration, error types, IDs, shutdown, and observability primitives for PCQ crates.
//!
//! Architecture role:
//! - defines continuous-query runtime configuration and the process slot layout
//! - provides common [`CqError`] / [`Result`] contracts
//! - hosts the shutdown signal, metrics and optional exporter utilities
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - [`shutdown`]
//! - `metrics_exporter` (feature-gated)
//!
//! Feature flags:
//! - `profiling`: enables the metrics HTTP exporter helpers.

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
#[cfg(feature = "profiling")]
pub mod metrics_exporter;
pub mod shutdown;

pub use config::{ContQueryConfig, ProcessLayout};
pub use error::{CqError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
#[cfg(feature = "profiling")]
pub use metrics_exporter::{run_metrics_exporter, serve_metrics};
pub use shutdown::Shutdown;
