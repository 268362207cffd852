//! Shared error types, IDs, and observability primitives for Quarry crates.
//!
//! Architecture role:
//! - provides common [`QuarryError`] / [`Result`] contracts
//! - defines typed identifiers used across the kernel and shuffle crates
//! - hosts the kernel metrics registry
//!
//! Key modules:
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod error;
pub mod ids;
pub mod metrics;

pub use error::{QuarryError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
