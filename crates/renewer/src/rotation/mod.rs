//! Certificate rotation on the load balancer
//!
//! Each newly issued certificate replaces the one the service currently
//! uses in four steps:
//!
//! 1. The existing certificate with the logical name, if any, is renamed to
//!    `<name><suffix>` so the name is free. It stays attached.
//! 2. The new certificate is uploaded under the logical name.
//! 3. The service on the configured port is pointed at the new certificate.
//! 4. The renamed certificate is deleted.
//!
//! A failing step stops the rotation of that certificate only, and never
//! leaves the service without a certificate: nothing is deleted unless the
//! service already serves the new one.

pub mod hetzner;
pub mod provider;

pub use hetzner::HetznerCloudClient;
pub use provider::{
    LbApiError, LbResult, LoadBalancer, LoadBalancerApi, NewCertificate, RemoteCertificate,
};

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use certwarden_common::LogicalName;

use crate::acme::CertificateRecord;

/// How far the rotation of one certificate progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RotationState {
    NotStarted,
    OldRenamed,
    NewCreated,
    ServiceUpdated,
    OldDeleted,
}

/// Rotation step that can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStep {
    LookupLoadBalancer,
    LookupCertificate,
    RenameOld,
    CreateNew,
    UpdateService,
    DeleteOld,
}

impl fmt::Display for RotationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RotationStep::LookupLoadBalancer => "load balancer lookup",
            RotationStep::LookupCertificate => "certificate lookup",
            RotationStep::RenameOld => "renaming the current certificate",
            RotationStep::CreateNew => "creating the new certificate",
            RotationStep::UpdateService => "updating the service",
            RotationStep::DeleteOld => "deleting the superseded certificate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("{step} failed: {source}")]
pub struct RotationError {
    pub step: RotationStep,
    #[source]
    pub source: LbApiError,
}

/// Result of rotating one certificate
#[derive(Debug)]
pub struct RotationOutcome {
    pub name: LogicalName,
    pub state: RotationState,
    pub error: Option<RotationError>,
}

impl RotationOutcome {
    /// The service serves the new certificate
    pub fn is_live(&self) -> bool {
        self.state >= RotationState::ServiceUpdated
    }

    /// Every step succeeded
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Pushes newly issued certificates to the load balancer
#[derive(Debug, Clone)]
pub struct RotationPropagator {
    api: Arc<dyn LoadBalancerApi>,
    superseded_suffix: String,
}

impl RotationPropagator {
    pub fn new(api: Arc<dyn LoadBalancerApi>, superseded_suffix: impl Into<String>) -> Self {
        Self {
            api,
            superseded_suffix: superseded_suffix.into(),
        }
    }

    /// Rotate every record, one after the other
    ///
    /// Failures are logged and recorded per record; they never stop the
    /// remaining records.
    pub async fn propagate(&self, records: &[CertificateRecord]) -> Vec<RotationOutcome> {
        info!(
            provider = self.api.name(),
            certificates = records.len(),
            "Pushing certificates to load balancers"
        );

        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let outcome = self.rotate(record).await;
            match &outcome.error {
                None => info!(
                    name = %record.logical_name,
                    lb_name = %record.lb_name,
                    lb_port = record.lb_port,
                    "Pushed certificate and updated load balancer"
                ),
                Some(e) if outcome.is_live() => warn!(
                    name = %record.logical_name,
                    lb_name = %record.lb_name,
                    lb_port = record.lb_port,
                    error = %e,
                    "Certificate is live but cleanup failed"
                ),
                Some(e) => error!(
                    name = %record.logical_name,
                    lb_name = %record.lb_name,
                    lb_port = record.lb_port,
                    state = ?outcome.state,
                    error = %e,
                    "Certificate rotation failed"
                ),
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Rotate one record
    pub async fn rotate(&self, record: &CertificateRecord) -> RotationOutcome {
        let mut outcome = RotationOutcome {
            name: record.logical_name.clone(),
            state: RotationState::NotStarted,
            error: None,
        };
        if let Err(e) = self.run_steps(record, &mut outcome.state).await {
            outcome.error = Some(e);
        }
        outcome
    }

    async fn run_steps(
        &self,
        record: &CertificateRecord,
        state: &mut RotationState,
    ) -> Result<(), RotationError> {
        let name = record.logical_name.as_str();
        let superseded_name = record.logical_name.superseded(&self.superseded_suffix);
        let fail = |step| move |source| RotationError { step, source };

        let load_balancer = self
            .api
            .get_load_balancer(&record.lb_name)
            .await
            .map_err(fail(RotationStep::LookupLoadBalancer))?
            .ok_or_else(|| RotationError {
                step: RotationStep::LookupLoadBalancer,
                source: LbApiError::NotFound {
                    kind: "load balancer",
                    name: record.lb_name.clone(),
                },
            })?;

        let current = self
            .api
            .get_certificate(name)
            .await
            .map_err(fail(RotationStep::LookupCertificate))?;

        let superseded = match current {
            Some(current) => {
                let renamed = self
                    .api
                    .rename_certificate(&current, &superseded_name)
                    .await
                    .map_err(fail(RotationStep::RenameOld))?;
                *state = RotationState::OldRenamed;
                Some(renamed)
            }
            // A previous rotation may have stopped after renaming; that
            // certificate is still the one to retire.
            None => {
                let leftover = self
                    .api
                    .get_certificate(&superseded_name)
                    .await
                    .map_err(fail(RotationStep::LookupCertificate))?;
                if leftover.is_some() {
                    warn!(name = %superseded_name, "Found superseded certificate from an earlier rotation");
                    *state = RotationState::OldRenamed;
                }
                leftover
            }
        };

        let created = self
            .api
            .create_certificate(&NewCertificate {
                name: name.to_string(),
                certificate: record.bundle.certificate.clone(),
                private_key: record.bundle.private_key.clone(),
                labels: record.labels.clone(),
            })
            .await
            .map_err(fail(RotationStep::CreateNew))?;
        *state = RotationState::NewCreated;

        self.api
            .update_service_certificate(&load_balancer, record.lb_port, &created)
            .await
            .map_err(fail(RotationStep::UpdateService))?;
        *state = RotationState::ServiceUpdated;

        if let Some(old) = superseded {
            self.api
                .delete_certificate(&old)
                .await
                .map_err(fail(RotationStep::DeleteOld))?;
            *state = RotationState::OldDeleted;
        }

        Ok(())
    }
}
