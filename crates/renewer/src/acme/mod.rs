//! ACME certificate issuance
//!
//! Obtains certificates from Let's Encrypt and compatible CAs using the
//! DNS-01 challenge through an acme-dns server.
//!
//! # Architecture
//!
//! - [`AccountStore`] - Crash-safe account ledger shared by issuance tasks
//! - [`CertificateLedger`] - Crash-safe ledger of issued certificates
//! - [`RenewalDecision`] - Pure renew-or-skip policy
//! - [`IssuanceDriver`] - Per-request workflow: account, DNS-01 setup, order
//! - [`AcmeConnector`] - CA capability, implemented by [`InstantAcmeConnector`]
//!
//! # Challenge Flow
//!
//! 1. The request's acme-dns credentials are stored for each of its domains
//! 2. [`AcmeSession`] creates an order for all domains of the request
//! 3. For each authorization, [`AcmeDnsSolver`] writes the DNS-01 value to
//!    the acme-dns subdomain that `_acme-challenge.<domain>` delegates to
//! 4. After the propagation delay the CA is asked to validate
//! 5. The order is finalized with a fresh certificate key and CSR
//! 6. The chain is split into leaf and issuer and recorded in the ledger

mod account;
mod challenge;
mod client;
mod error;
mod issuance;
mod policy;
mod storage;

pub use account::{Account, AccountKey, AccountLedger, AccountStore, DecodedKey};
pub use challenge::{
    challenge_record_fqdn, normalize_domain, AcmeDnsClient, AcmeDnsSolver, Dns01Solver,
    DnsCredentialStore, DnsCredentials, DnsError, FileCredentialStore, ACME_CHALLENGE_RECORD,
};
pub use client::{
    leaf_not_after, split_issuer_chain, AcmeConnector, AcmeSession, ConnectOptions,
    InstantAcmeConnector,
};
pub use error::{AcmeError, StorageError};
pub use issuance::IssuanceDriver;
pub use policy::{should_renew, RenewalDecision};
pub use storage::{CertificateBundle, CertificateLedger, CertificateRecord};
