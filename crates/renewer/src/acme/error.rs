//! ACME error types

use std::io;
use std::time::Duration;

use thiserror::Error;

use super::challenge::DnsError;

/// Errors that can occur while obtaining a certificate for one request
#[derive(Debug, Error)]
pub enum AcmeError {
    /// Stored account key could not be decoded
    #[error("Failed to decode account key for '{email}': {message}")]
    AccountKey { email: String, message: String },

    /// Registration with the CA failed
    #[error("Failed to register ACME account for '{email}': {message}")]
    Registration { email: String, message: String },

    /// Session has no account registration to act on
    #[error("ACME account for '{0}' is not registered")]
    NotRegistered(String),

    /// Failed to create certificate order
    #[error("Failed to create certificate order: {0}")]
    OrderCreation(String),

    /// DNS-01 challenge not offered for a domain
    #[error("No DNS-01 challenge available for domain '{0}'")]
    NoDns01Challenge(String),

    /// `obtain` called before a DNS-01 solver was bound
    #[error("DNS-01 challenge requires a solver")]
    NoDnsSolver,

    /// Challenge validation failed
    #[error("Challenge validation failed for domain '{domain}': {message}")]
    ChallengeValidation { domain: String, message: String },

    /// Certificate key or CSR generation failed
    #[error("Failed to generate certificate key material: {0}")]
    KeyGeneration(String),

    /// Certificate finalization failed
    #[error("Failed to finalize certificate: {0}")]
    Finalization(String),

    /// Issued chain could not be parsed
    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),

    /// Order polling exceeded its deadline
    #[error("Operation timed out after {elapsed:?}: {operation}")]
    Timeout { operation: String, elapsed: Duration },

    /// DNS-01 provider operation failed
    #[error("DNS-01 error: {0}")]
    Dns(#[from] DnsError),

    /// Ledger persistence failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// ACME protocol error from instant-acme
    #[error("ACME protocol error: {0}")]
    Protocol(String),
}

/// Errors specific to ledger persistence
#[derive(Debug, Error)]
pub enum StorageError {
    /// Ledger file does not exist yet
    #[error("Ledger file not found: {path}")]
    NotFound { path: String },

    /// Ledger file exists but is not a valid ledger
    #[error("Ledger file {path} is corrupt: {message}")]
    Corrupt { path: String, message: String },

    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize data
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}

impl From<rcgen::Error> for AcmeError {
    fn from(e: rcgen::Error) -> Self {
        AcmeError::KeyGeneration(e.to_string())
    }
}
