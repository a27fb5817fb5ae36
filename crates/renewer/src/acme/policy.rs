//! Renewal policy
//!
//! A certificate is renewed when there is no record for it, or when its
//! `next_update` lies strictly in the past.

use chrono::{DateTime, Utc};

use super::storage::CertificateRecord;

/// Outcome of evaluating one request against the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalDecision {
    /// No certificate has been issued yet
    Issue,
    /// The existing certificate is due
    Renew { due_since: DateTime<Utc> },
    /// The existing certificate is kept
    Skip { next_update: DateTime<Utc> },
}

impl RenewalDecision {
    pub fn evaluate(existing: Option<&CertificateRecord>, now: DateTime<Utc>) -> Self {
        match existing {
            None => RenewalDecision::Issue,
            Some(record) if record.next_update < now => RenewalDecision::Renew {
                due_since: record.next_update,
            },
            Some(record) => RenewalDecision::Skip {
                next_update: record.next_update,
            },
        }
    }

    pub fn needs_certificate(&self) -> bool {
        !matches!(self, RenewalDecision::Skip { .. })
    }
}

/// Whether a certificate must be (re)issued at `now`
pub fn should_renew(existing: Option<&CertificateRecord>, now: DateTime<Utc>) -> bool {
    RenewalDecision::evaluate(existing, now).needs_certificate()
}
