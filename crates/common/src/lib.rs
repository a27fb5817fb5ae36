//! Shared building blocks for certwarden crates.
//!
//! - [`domain`] - Domain keys shared by validation and DNS-01 storage
//! - [`ids`] - Identifier newtypes used across the renewal pipeline
//! - [`observability`] - Tracing subscriber setup

pub mod domain;
pub mod ids;
pub mod observability;

pub use domain::normalize_domain;
pub use ids::{CycleId, LogicalName};
pub use observability::{init_tracing, LogFormat, TracingError};
