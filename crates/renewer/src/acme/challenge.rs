//! DNS-01 challenges through acme-dns
//!
//! Each domain's `_acme-challenge` record is a CNAME pointing at an acme-dns
//! subdomain. Answering a challenge means updating that subdomain's TXT value
//! through the acme-dns HTTP API, using the credentials registered for the
//! domain.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};

pub use certwarden_common::normalize_domain;
use certwarden_config::AcmeDnsAccount;

use super::storage::write_atomic;

/// ACME challenge record name prefix
pub const ACME_CHALLENGE_RECORD: &str = "_acme-challenge";

/// Errors raised while answering DNS-01 challenges
#[derive(Debug, Error)]
pub enum DnsError {
    /// No acme-dns credentials stored for the domain
    #[error("No acme-dns credentials for domain '{domain}'")]
    NoCredentials { domain: String },

    /// acme-dns rejected the credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// API request failed
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Request timeout
    #[error("Request timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Credential storage could not be read or written
    #[error("Credential storage error: {0}")]
    Storage(String),
}

/// Credentials of one acme-dns account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsCredentials {
    pub username: String,
    pub password: String,
    #[serde(alias = "fulldomain")]
    pub full_domain: String,
    #[serde(alias = "subdomain")]
    pub sub_domain: String,
}

impl From<&AcmeDnsAccount> for DnsCredentials {
    fn from(account: &AcmeDnsAccount) -> Self {
        Self {
            username: account.username.clone(),
            password: account.password.clone(),
            full_domain: account.full_domain.clone(),
            sub_domain: account.sub_domain.clone(),
        }
    }
}

impl fmt::Debug for DnsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsCredentials")
            .field("username", &self.username)
            .field("full_domain", &self.full_domain)
            .field("sub_domain", &self.sub_domain)
            .finish()
    }
}

/// `_acme-challenge.<domain>`
pub fn challenge_record_fqdn(domain: &str) -> String {
    format!("{}.{}", ACME_CHALLENGE_RECORD, normalize_domain(domain))
}

/// Domain-keyed acme-dns credential storage
///
/// Shared by every issuance task of a cycle; implementations serialize
/// their own writes.
pub trait DnsCredentialStore: Send + Sync + fmt::Debug {
    fn put(&self, domain: &str, credentials: &DnsCredentials) -> Result<(), DnsError>;

    fn get(&self, domain: &str) -> Result<Option<DnsCredentials>, DnsError>;
}

/// Credential storage persisted as one JSON object keyed by domain
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, DnsCredentials>>,
}

impl FileCredentialStore {
    /// Open the store, starting empty when the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DnsError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                DnsError::Storage(format!("{} is corrupt: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(DnsError::Storage(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl DnsCredentialStore for FileCredentialStore {
    fn put(&self, domain: &str, credentials: &DnsCredentials) -> Result<(), DnsError> {
        let key = normalize_domain(domain);
        let mut entries = self.entries.lock();

        if entries.get(&key) == Some(credentials) {
            trace!(domain = %key, "acme-dns credentials unchanged");
            return Ok(());
        }

        let previous = entries.insert(key.clone(), credentials.clone());
        let written = serde_json::to_vec_pretty(&*entries)
            .map_err(|e| DnsError::Storage(e.to_string()))
            .and_then(|content| {
                write_atomic(&self.path, &content).map_err(|e| DnsError::Storage(e.to_string()))
            });

        if let Err(e) = written {
            match previous {
                Some(previous) => entries.insert(key, previous),
                None => entries.remove(&key),
            };
            return Err(e);
        }

        debug!(domain = %key, full_domain = %credentials.full_domain, "Stored acme-dns credentials");
        Ok(())
    }

    fn get(&self, domain: &str) -> Result<Option<DnsCredentials>, DnsError> {
        Ok(self.entries.lock().get(&normalize_domain(domain)).cloned())
    }
}

/// Client for the acme-dns `/update` endpoint
#[derive(Debug, Clone)]
pub struct AcmeDnsClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    subdomain: &'a str,
    txt: &'a str,
}

impl AcmeDnsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DnsError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            DnsError::Configuration(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Set the TXT value served for the credentials' subdomain
    pub async fn update_txt(&self, credentials: &DnsCredentials, value: &str) -> Result<(), DnsError> {
        let response = self
            .client
            .post(format!("{}/update", self.base_url))
            .header("X-Api-User", &credentials.username)
            .header("X-Api-Key", &credentials.password)
            .json(&UpdateRequest {
                subdomain: &credentials.sub_domain,
                txt: value,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DnsError::Timeout {
                        elapsed_secs: self.timeout.as_secs(),
                    }
                } else {
                    DnsError::ApiRequest(format!("Failed to update TXT record: {}", e))
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(DnsError::Authentication(format!(
                "acme-dns rejected credentials for subdomain '{}'",
                credentials.sub_domain
            )));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DnsError::ApiRequest(format!(
                "Failed to update TXT record: HTTP {} - {}",
                status, body
            )));
        }

        trace!(subdomain = %credentials.sub_domain, "acme-dns TXT record updated");
        Ok(())
    }
}

/// Publishes and withdraws DNS-01 validation values
#[async_trait]
pub trait Dns01Solver: Send + Sync + fmt::Debug {
    /// Make `value` visible at the domain's challenge record
    async fn present(&self, domain: &str, value: &str) -> Result<(), DnsError>;

    /// Withdraw a value published by `present`
    async fn cleanup(&self, domain: &str, value: &str) -> Result<(), DnsError>;
}

/// DNS-01 solver backed by acme-dns and a credential store
#[derive(Debug, Clone)]
pub struct AcmeDnsSolver {
    store: Arc<dyn DnsCredentialStore>,
    client: AcmeDnsClient,
}

impl AcmeDnsSolver {
    pub fn new(store: Arc<dyn DnsCredentialStore>, client: AcmeDnsClient) -> Self {
        Self { store, client }
    }
}

#[async_trait]
impl Dns01Solver for AcmeDnsSolver {
    async fn present(&self, domain: &str, value: &str) -> Result<(), DnsError> {
        let credentials = self
            .store
            .get(domain)?
            .ok_or_else(|| DnsError::NoCredentials {
                domain: domain.to_string(),
            })?;

        info!(
            record = %challenge_record_fqdn(domain),
            target = %credentials.full_domain,
            "Publishing DNS-01 challenge"
        );
        self.client.update_txt(&credentials, value).await
    }

    async fn cleanup(&self, domain: &str, _value: &str) -> Result<(), DnsError> {
        // acme-dns keeps the two most recent values and has no delete call.
        trace!(domain = %domain, "Nothing to clean up on acme-dns");
        Ok(())
    }
}
