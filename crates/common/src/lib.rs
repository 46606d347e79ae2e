//! WeightLink common library
//!
//! This crate contains shared code used across WeightLink components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use self::config::WeightLinkConfig;
pub use error::{ErrorClass, Result, WeightLinkError};
pub use metrics::{MetricsRegistry, METRICS};
