//! Load balancer API trait
//!
//! Defines the operations the rotation needs from a cloud load balancer
//! service. Implementations must be safe to share between tasks.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Result type for load balancer API operations
pub type LbResult<T> = Result<T, LbApiError>;

/// Errors that can occur talking to the load balancer API
#[derive(Debug, Error)]
pub enum LbApiError {
    /// The API token was rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A named resource does not exist
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// The API answered with an error
    #[error("API error (HTTP {status}, {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Request could not be sent or the response not read
    #[error("API request failed: {0}")]
    Request(String),

    /// Rate limited by the API
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Request timeout
    #[error("Request timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancer {
    pub id: u64,
    pub name: String,
}

/// A certificate stored at the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCertificate {
    pub id: u64,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Certificate to upload
#[derive(Clone, PartialEq, Eq)]
pub struct NewCertificate {
    pub name: String,
    /// PEM chain, leaf first
    pub certificate: String,
    /// PEM private key
    pub private_key: String,
    pub labels: BTreeMap<String, String>,
}

impl fmt::Debug for NewCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewCertificate")
            .field("name", &self.name)
            .field("labels", &self.labels)
            .finish()
    }
}

/// Operations on a load balancer service's certificates
#[async_trait]
pub trait LoadBalancerApi: Send + Sync + fmt::Debug {
    /// Returns the provider name (e.g., "hetzner")
    fn name(&self) -> &'static str;

    /// Look up a load balancer by exact name
    async fn get_load_balancer(&self, name: &str) -> LbResult<Option<LoadBalancer>>;

    /// Look up a certificate by exact name
    async fn get_certificate(&self, name: &str) -> LbResult<Option<RemoteCertificate>>;

    /// Rename a certificate, returning it under its new name
    async fn rename_certificate(
        &self,
        certificate: &RemoteCertificate,
        new_name: &str,
    ) -> LbResult<RemoteCertificate>;

    /// Upload a certificate
    async fn create_certificate(&self, certificate: &NewCertificate) -> LbResult<RemoteCertificate>;

    /// Make `certificate` the only certificate of the service listening on
    /// `port`
    async fn update_service_certificate(
        &self,
        load_balancer: &LoadBalancer,
        port: u16,
        certificate: &RemoteCertificate,
    ) -> LbResult<()>;

    /// Delete a certificate
    async fn delete_certificate(&self, certificate: &RemoteCertificate) -> LbResult<()>;
}
