//! AnyInfer common library
//!
//! This crate contains shared code used across AnyInfer components.

pub mod config;
pub mod error;
pub mod metrics;
pub mod retry;

// Re-export commonly used types
pub use config::AnyInferConfig;
pub use error::{AnyInferError, Result};
pub use metrics::{LatencyTimer, MetricsRegistry, METRICS};
pub use retry::Backoff;
