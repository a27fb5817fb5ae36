//! Process-level settings.
//!
//! Read from `CERTWARDEN_*` environment variables. Every field has a default
//! except the load balancer API token, which is only required when a cycle
//! actually propagates certificates.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use certwarden_common::LogFormat;

use crate::ConfigError;

/// Environment variable prefix for all settings
pub const ENV_PREFIX: &str = "CERTWARDEN_";

/// Let's Encrypt production directory URL
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory URL
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Public acme-dns instance
pub const DEFAULT_ACME_DNS_URL: &str = "https://auth.acme-dns.io";
/// Hetzner Cloud API base URL
pub const DEFAULT_HETZNER_API_URL: &str = "https://api.hetzner.cloud/v1";

/// Eight weeks: renewing this long after issuance leaves a month of slack on
/// a 90-day certificate.
pub const DEFAULT_RENEW_AFTER_DAYS: u32 = 56;

/// Key algorithm for the issued certificate's private key
///
/// Independent of the ACME account key type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateKeyType {
    #[default]
    Rsa2048,
    Rsa3072,
    Rsa4096,
    Ec256,
    Ec384,
}

impl fmt::Display for CertificateKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Rsa2048 => "rsa2048",
            Self::Rsa3072 => "rsa3072",
            Self::Rsa4096 => "rsa4096",
            Self::Ec256 => "ec256",
            Self::Ec384 => "ec384",
        };
        f.write_str(s)
    }
}

/// Process settings
#[derive(Clone, Deserialize)]
pub struct Settings {
    /// Directory holding the ledgers, the request file and DNS credentials
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// ACME CA directory URL
    #[serde(default = "default_ca_url")]
    pub ca_url: String,

    /// acme-dns server base URL
    #[serde(default = "default_acme_dns_url")]
    pub acme_dns_url: String,

    /// Hetzner Cloud API token
    #[serde(default)]
    pub hetzner_api_token: Option<String>,

    /// Hetzner Cloud API base URL
    #[serde(default = "default_hetzner_api_url")]
    pub hetzner_api_url: String,

    /// Days after issuance at which a certificate becomes due for renewal
    #[serde(default = "default_renew_after_days")]
    pub renew_after_days: u32,

    /// Key type requested for issued certificates
    #[serde(default)]
    pub key_type: CertificateKeyType,

    /// Seconds between scheduled renewal cycles
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Seconds to wait after publishing DNS-01 records before asking the CA
    /// to validate
    #[serde(default = "default_dns_propagation_delay_secs")]
    pub dns_propagation_delay_secs: u64,

    /// Upper bound for ACME order validation and issuance polling
    #[serde(default = "default_acme_timeout_secs")]
    pub acme_timeout_secs: u64,

    /// Request timeout for the acme-dns and load balancer HTTP clients
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,

    /// Suffix appended to a remote certificate's name while it is superseded
    #[serde(default = "default_superseded_suffix")]
    pub superseded_suffix: String,

    /// Default log filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,
}

impl Settings {
    /// Load settings from `CERTWARDEN_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings: Settings = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| ConfigError::Environment(e.to_string()))?;

        trace!(settings = ?settings, "Loaded settings from environment");
        Ok(settings)
    }

    /// Load settings from explicit key/value pairs (keys without prefix are
    /// ignored, as with the real environment)
    pub fn from_pairs<I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed(ENV_PREFIX)
            .from_iter(pairs)
            .map_err(|e| ConfigError::Environment(e.to_string()))
    }

    /// File locations derived from `data_dir`
    pub fn paths(&self) -> Paths {
        Paths::new(&self.data_dir)
    }

    /// Time between issuance and the next renewal
    pub fn renewal_lead_time(&self) -> Duration {
        Duration::from_secs(u64::from(self.renew_after_days) * 86_400)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn dns_propagation_delay(&self) -> Duration {
        Duration::from_secs(self.dns_propagation_delay_secs)
    }

    pub fn acme_timeout(&self) -> Duration {
        Duration::from_secs(self.acme_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ca_url: default_ca_url(),
            acme_dns_url: default_acme_dns_url(),
            hetzner_api_token: None,
            hetzner_api_url: default_hetzner_api_url(),
            renew_after_days: default_renew_after_days(),
            key_type: CertificateKeyType::default(),
            check_interval_secs: default_check_interval_secs(),
            dns_propagation_delay_secs: default_dns_propagation_delay_secs(),
            acme_timeout_secs: default_acme_timeout_secs(),
            api_timeout_secs: default_api_timeout_secs(),
            superseded_suffix: default_superseded_suffix(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("data_dir", &self.data_dir)
            .field("ca_url", &self.ca_url)
            .field("acme_dns_url", &self.acme_dns_url)
            .field("has_hetzner_api_token", &self.hetzner_api_token.is_some())
            .field("hetzner_api_url", &self.hetzner_api_url)
            .field("renew_after_days", &self.renew_after_days)
            .field("key_type", &self.key_type)
            .field("check_interval_secs", &self.check_interval_secs)
            .field("dns_propagation_delay_secs", &self.dns_propagation_delay_secs)
            .field("acme_timeout_secs", &self.acme_timeout_secs)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("superseded_suffix", &self.superseded_suffix)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .finish()
    }
}

/// Locations of every file under the data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub accounts: PathBuf,
    pub certificates: PathBuf,
    pub certificates_backup: PathBuf,
    pub requests: PathBuf,
    pub dns_credentials: PathBuf,
}

impl Paths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            accounts: data_dir.join("accounts.json"),
            certificates: data_dir.join("certs.json"),
            certificates_backup: data_dir.join("certs_backup.json"),
            requests: data_dir.join("cert-requests.json"),
            dns_credentials: data_dir.join("acme-dns.json"),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_ca_url() -> String {
    LETSENCRYPT_PRODUCTION.to_string()
}

fn default_acme_dns_url() -> String {
    DEFAULT_ACME_DNS_URL.to_string()
}

fn default_hetzner_api_url() -> String {
    DEFAULT_HETZNER_API_URL.to_string()
}

fn default_renew_after_days() -> u32 {
    DEFAULT_RENEW_AFTER_DAYS
}

fn default_check_interval_secs() -> u64 {
    24 * 3600
}

fn default_dns_propagation_delay_secs() -> u64 {
    15
}

fn default_acme_timeout_secs() -> u64 {
    180
}

fn default_api_timeout_secs() -> u64 {
    30
}

fn default_superseded_suffix() -> String {
    "-old".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
