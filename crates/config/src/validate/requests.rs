//! Request file validation
//!
//! Every DNS-01 record for a domain lives in one shared credential store
//! keyed by domain, and a load balancer service holds one certificate per
//! port. Requests that would overwrite each other's entries are rejected.
//!
//! Entry checks and conflict checks are kept apart: a bad entry can be
//! dropped on its own, while a conflict involves several entries.

use std::collections::{BTreeMap, BTreeSet};

use validator::Validate;

use certwarden_common::normalize_domain;

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::requests::{AcmeDnsAccount, CertificateRequest};

/// Validate a request set, per entry and across entries
pub fn validate_requests(requests: &[CertificateRequest]) -> ValidationResult {
    let mut result = ValidationResult::new();
    for (idx, request) in requests.iter().enumerate() {
        result.merge(validate_request(idx, request));
    }
    let entries: Vec<_> = requests.iter().enumerate().collect();
    result.merge(check_conflicts(&entries));
    result
}

/// Field and domain checks for the entry at `idx`
pub fn validate_request(idx: usize, request: &CertificateRequest) -> ValidationResult {
    let mut result = ValidationResult::new();
    if let Err(errors) = request.validate() {
        result.add_error(ValidationError::new(
            ErrorCategory::Schema,
            format!("request #{} ('{}'): {}", idx, request.target.name, errors),
        ));
    }
    result.merge(validate_domains(idx, request));
    result
}

/// Conflicts between entries, each given with its position in the file
pub fn check_conflicts(entries: &[(usize, &CertificateRequest)]) -> ValidationResult {
    let mut result = ValidationResult::new();
    result.merge(check_duplicate_names(entries));
    result.merge(check_domain_collisions(entries));
    result.merge(check_shared_services(entries));
    result
}

fn validate_domains(idx: usize, request: &CertificateRequest) -> ValidationResult {
    let mut result = ValidationResult::new();
    let mut seen = BTreeSet::new();

    for domain in request.domains() {
        if domain.trim().is_empty() || domain.chars().any(char::is_whitespace) {
            result.add_error(ValidationError::new(
                ErrorCategory::Schema,
                format!("request #{} has an invalid domain '{}'", idx, domain),
            ));
            continue;
        }
        if !seen.insert(domain.to_ascii_lowercase()) {
            result.add_warning(ValidationWarning::new(format!(
                "request #{} lists domain '{}' more than once",
                idx, domain
            )));
        }
    }

    result
}

fn check_duplicate_names(entries: &[(usize, &CertificateRequest)]) -> ValidationResult {
    let mut result = ValidationResult::new();
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();

    for &(idx, request) in entries {
        let name = request.target.name.as_str();
        if let Some(first) = seen.insert(name, idx) {
            result.add_error(ValidationError::new(
                ErrorCategory::Conflict,
                format!(
                    "logical name '{}' is used by requests #{} and #{}",
                    name, first, idx
                ),
            ));
        }
    }

    result
}

fn same_credentials(a: &AcmeDnsAccount, b: &AcmeDnsAccount) -> bool {
    a.username == b.username
        && a.password == b.password
        && a.full_domain == b.full_domain
        && a.sub_domain == b.sub_domain
}

/// A domain may appear in several requests only when they all answer its
/// challenge with the same acme-dns account.
fn check_domain_collisions(entries: &[(usize, &CertificateRequest)]) -> ValidationResult {
    let mut result = ValidationResult::new();
    let mut owners: BTreeMap<String, (usize, &AcmeDnsAccount)> = BTreeMap::new();

    for &(idx, request) in entries {
        let own: BTreeSet<String> = request
            .domains()
            .iter()
            .map(|d| normalize_domain(d))
            .collect();

        for owner in own {
            match owners.get(&owner) {
                Some(&(first, credentials)) => {
                    if !same_credentials(credentials, &request.acme_dns) {
                        result.add_error(ValidationError::new(
                            ErrorCategory::Conflict,
                            format!(
                                "domain '{}' is claimed by requests #{} and #{} with different \
                                 acme-dns credentials; their DNS-01 entries would overwrite \
                                 each other",
                                owner, first, idx
                            ),
                        ));
                    }
                }
                None => {
                    owners.insert(owner, (idx, &request.acme_dns));
                }
            }
        }
    }

    result
}

fn check_shared_services(entries: &[(usize, &CertificateRequest)]) -> ValidationResult {
    let mut result = ValidationResult::new();
    let mut services: BTreeMap<(&str, u16), usize> = BTreeMap::new();

    for &(idx, request) in entries {
        let key = (request.target.lb_name.as_str(), request.target.lb_port);
        if let Some(first) = services.insert(key, idx) {
            result.add_error(ValidationError::new(
                ErrorCategory::Conflict,
                format!(
                    "load balancer '{}' port {} is targeted by requests #{} and #{}",
                    key.0, key.1, first, idx
                ),
            ));
        }
    }

    result
}
