//! certwarden library
//!
//! Renews TLS certificates over ACME DNS-01 and rotates them on cloud load
//! balancers.
//!
//! - **Issuance**: concurrent ACME orders, one per certificate request,
//!   with DNS-01 answered through acme-dns
//! - **Ledgers**: crash-safe JSON ledgers for ACME accounts and issued
//!   certificates, with a backup taken before every change
//! - **Rotation**: rename, upload, attach and delete on the load balancer,
//!   in an order that never leaves a service without a certificate
//! - **Scheduling**: one cycle per interval, never overlapping
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use certwarden::{RenewalOrchestrator, RenewalScheduler};
//! use certwarden_config::Settings;
//!
//! let settings = Settings::from_env()?;
//! let orchestrator = Arc::new(RenewalOrchestrator::from_settings(&settings)?);
//! let report = orchestrator.run_cycle().await;
//! println!("issued {} certificates", report.issued.len());
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod orchestrator;
pub mod rotation;
pub mod scheduler;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Renewal cycle
pub use orchestrator::{CyclePhase, CycleReport, IssuanceFailure, RenewalOrchestrator, SetupError};
pub use scheduler::RenewalScheduler;

// Issuance
pub use acme::{AcmeError, CertificateLedger, CertificateRecord, IssuanceDriver, StorageError};

// Rotation
pub use rotation::{RotationOutcome, RotationPropagator, RotationState};
