//! Certificate request file.
//!
//! The request file is a JSON array; each entry names who requests the
//! certificate, how DNS-01 is answered for its domains, and which load
//! balancer slot the issued certificate is pushed to.
//!
//! ```json
//! [
//!   {
//!     "email": "ops@example.com",
//!     "acme_dns": {
//!       "username": "...", "password": "...",
//!       "full_domain": "8e5700ea.auth.acme-dns.io", "sub_domain": "8e5700ea",
//!       "domains": ["example.com", "*.example.com"]
//!     },
//!     "target": { "name": "example-com", "labels": {"env": "prod"},
//!                 "lb_name": "edge-lb", "lb_port": 443 }
//!   }
//! ]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use validator::Validate;

use certwarden_common::LogicalName;

use crate::validate::{check_conflicts, validate_request, ValidationResult};
use crate::ConfigError;

/// One certificate to keep renewed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CertificateRequest {
    /// ACME account identity
    #[validate(email)]
    pub email: String,

    /// DNS-01 credentials and the domains they cover
    #[serde(alias = "acmedns")]
    #[validate(nested)]
    pub acme_dns: AcmeDnsAccount,

    /// Where the issued certificate is installed
    #[serde(alias = "hetzner")]
    #[validate(nested)]
    pub target: LoadBalancerTarget,
}

impl CertificateRequest {
    /// Logical name correlating this request with its ledger record and its
    /// remote certificate
    pub fn logical_name(&self) -> LogicalName {
        LogicalName::new(self.target.name.clone())
    }

    /// Domains the certificate must cover
    pub fn domains(&self) -> &[String] {
        &self.acme_dns.domains
    }
}

/// acme-dns account registered for the request's domains
///
/// Each domain's `_acme-challenge` record is expected to be a CNAME to
/// `full_domain`.
#[derive(Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AcmeDnsAccount {
    #[validate(length(min = 1))]
    pub username: String,

    #[validate(length(min = 1))]
    pub password: String,

    #[validate(length(min = 1))]
    pub full_domain: String,

    #[validate(length(min = 1))]
    pub sub_domain: String,

    #[validate(length(min = 1))]
    pub domains: Vec<String>,
}

impl fmt::Debug for AcmeDnsAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeDnsAccount")
            .field("username", &self.username)
            .field("full_domain", &self.full_domain)
            .field("sub_domain", &self.sub_domain)
            .field("domains", &self.domains)
            .finish()
    }
}

/// Load balancer certificate slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct LoadBalancerTarget {
    /// Logical certificate name, also the remote certificate's name
    #[validate(length(min = 1))]
    pub name: String,

    /// Labels attached to the remote certificate
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Name of the load balancer whose service is updated
    #[validate(length(min = 1))]
    pub lb_name: String,

    /// Listen port of the TLS service on that load balancer
    #[validate(range(min = 1))]
    pub lb_port: u16,
}

/// Load and validate the request file
///
/// A missing file, an empty array, malformed JSON, a file with no valid
/// entry and conflicting entries are reported as errors; callers treat every
/// one of them as "nothing to do this cycle". Individual invalid entries are
/// logged and dropped.
pub fn load_requests(path: &Path) -> Result<Vec<CertificateRequest>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ConfigError::RequestsNotFound {
                path: path.display().to_string(),
            }
        } else {
            ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            }
        }
    })?;

    let requests = parse_requests(&content).map_err(|e| match e {
        ConfigError::Parse { message, .. } => ConfigError::Parse {
            path: path.display().to_string(),
            message,
        },
        ConfigError::EmptyRequests { .. } => ConfigError::EmptyRequests {
            path: path.display().to_string(),
        },
        other => other,
    })?;

    debug!(
        path = %path.display(),
        request_count = requests.len(),
        "Loaded certificate requests"
    );
    Ok(requests)
}

/// Parse and validate request file content
///
/// Entries failing their own checks are dropped with a warning; the rest
/// must be free of conflicts with each other.
pub fn parse_requests(content: &str) -> Result<Vec<CertificateRequest>, ConfigError> {
    let requests: Vec<CertificateRequest> =
        serde_json::from_str(content).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;

    if requests.is_empty() {
        return Err(ConfigError::EmptyRequests {
            path: "<inline>".to_string(),
        });
    }

    let mut accepted = Vec::with_capacity(requests.len());
    let mut rejected = Vec::new();
    for (idx, request) in requests.into_iter().enumerate() {
        let result = validate_request(idx, &request);
        log_warnings(&result);
        if result.is_valid() {
            accepted.push((idx, request));
            continue;
        }
        for error in &result.errors {
            warn!(
                index = idx,
                name = %request.target.name,
                error = %error,
                "Dropping invalid certificate request"
            );
        }
        rejected.extend(result.errors.iter().map(ToString::to_string));
    }

    if accepted.is_empty() {
        return Err(ConfigError::Invalid { errors: rejected });
    }

    let entries: Vec<_> = accepted.iter().map(|(idx, r)| (*idx, r)).collect();
    let conflicts = check_conflicts(&entries);
    log_warnings(&conflicts);
    if !conflicts.is_valid() {
        return Err(ConfigError::Invalid {
            errors: conflicts.errors.iter().map(ToString::to_string).collect(),
        });
    }

    Ok(accepted.into_iter().map(|(_, request)| request).collect())
}

fn log_warnings(result: &ValidationResult) {
    for warning in &result.warnings {
        warn!(warning = %warning, "Certificate request warning");
    }
}
