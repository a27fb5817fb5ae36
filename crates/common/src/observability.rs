//! Logging setup for certwarden
//!
//! All failures in a renewal cycle surface only through structured logs, so
//! the subscriber is configured once at process start and every component
//! logs through `tracing` macros with structured fields.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{fmt as tfmt, prelude::*, EnvFilter};

/// Output format for log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line, for log shippers
    Json,
    /// Multi-line human readable output
    Pretty,
    /// Single-line human readable output
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" | "text" => Ok(Self::Compact),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
            Self::Compact => "compact",
        };
        f.write_str(s)
    }
}

/// Errors raised while installing the global subscriber
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("Invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Initialize the tracing/logging subsystem
///
/// `RUST_LOG` takes precedence over `default_level` so operators can raise
/// verbosity for a single module without touching configuration.
pub fn init_tracing(default_level: &str, format: LogFormat) -> Result<(), TracingError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level).map_err(|e| TracingError::InvalidFilter {
            filter: default_level.to_string(),
            message: e.to_string(),
        })?,
    };

    let json_layer = (format == LogFormat::Json).then(|| {
        tfmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
    });

    let pretty_layer =
        (format == LogFormat::Pretty).then(|| tfmt::layer().pretty().with_target(true));

    let compact_layer =
        (format == LogFormat::Compact).then(|| tfmt::layer().compact().with_target(false));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .with(compact_layer)
        .try_init()
        .map_err(|e| TracingError::Install(e.to_string()))?;

    info!(format = %format, "Tracing initialized");
    Ok(())
}
