//! Configuration for certwarden.
//!
//! Two sources feed a renewal cycle:
//!
//! - [`Settings`]: process-wide knobs from `CERTWARDEN_*` environment
//!   variables (data directory, CA, API endpoints, renewal policy).
//! - [`CertificateRequest`]s: the JSON request file under the data
//!   directory, re-read at the start of every cycle.

use thiserror::Error;

pub mod requests;
pub mod settings;
pub mod validate;

pub use requests::{
    load_requests, parse_requests, AcmeDnsAccount, CertificateRequest, LoadBalancerTarget,
};
pub use settings::{
    CertificateKeyType, Paths, Settings, DEFAULT_ACME_DNS_URL, DEFAULT_HETZNER_API_URL,
    DEFAULT_RENEW_AFTER_DAYS, ENV_PREFIX, LETSENCRYPT_PRODUCTION, LETSENCRYPT_STAGING,
};
pub use validate::{
    check_conflicts, validate_request, validate_requests, validate_settings, ErrorCategory, ValidationError, ValidationResult,
    ValidationWarning,
};

/// Errors raised while loading settings or the request file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Request file not found: {path}")]
    RequestsNotFound { path: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Request file {path} contains no requests")]
    EmptyRequests { path: String },

    #[error("Invalid configuration: {}", errors.join("; "))]
    Invalid { errors: Vec<String> },

    #[error("Invalid environment: {0}")]
    Environment(String),
}
