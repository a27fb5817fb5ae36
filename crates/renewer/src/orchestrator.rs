//! Renewal cycle
//!
//! One cycle walks through fixed phases:
//!
//! ```text
//! LoadingRequests -> LoadingLedger -> BackingUp -> Issuing -> Merging
//!                 -> Saving -> Propagating -> Done
//! ```
//!
//! Configuration and ledger problems end the cycle early and are reported,
//! never raised: the process keeps running and tries again next interval.
//! Issuance runs one task per due request; results flow back to the cycle
//! task, which is the only writer of the certificate ledger.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use certwarden_common::{CycleId, LogicalName};
use certwarden_config::{load_requests, CertificateRequest, ConfigError, Paths, Settings};

use crate::acme::{
    AccountStore, AcmeConnector, AcmeDnsClient, AcmeDnsSolver, AcmeError, CertificateLedger,
    CertificateRecord, ConnectOptions, Dns01Solver, DnsCredentialStore, DnsError,
    FileCredentialStore, InstantAcmeConnector, IssuanceDriver, RenewalDecision,
};
use crate::rotation::{
    HetznerCloudClient, LbApiError, LoadBalancerApi, RotationOutcome, RotationPropagator,
};

/// Phase a cycle reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CyclePhase {
    LoadingRequests,
    LoadingLedger,
    BackingUp,
    Issuing,
    Merging,
    Saving,
    Propagating,
    Done,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CyclePhase::LoadingRequests => "loading requests",
            CyclePhase::LoadingLedger => "loading ledger",
            CyclePhase::BackingUp => "backing up",
            CyclePhase::Issuing => "issuing",
            CyclePhase::Merging => "merging",
            CyclePhase::Saving => "saving",
            CyclePhase::Propagating => "propagating",
            CyclePhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// A request whose certificate could not be obtained
#[derive(Debug, Clone)]
pub struct IssuanceFailure {
    pub name: LogicalName,
    pub error: String,
}

/// What one cycle did
#[derive(Debug)]
pub struct CycleReport {
    pub cycle_id: CycleId,
    /// Last phase entered; `Done` when the cycle ran to completion
    pub phase: CyclePhase,
    /// Why the cycle stopped before `Done`
    pub aborted: Option<String>,
    pub issued: Vec<LogicalName>,
    pub skipped: Vec<LogicalName>,
    pub failed: Vec<IssuanceFailure>,
    pub rotations: Vec<RotationOutcome>,
}

impl CycleReport {
    fn new(cycle_id: CycleId) -> Self {
        Self {
            cycle_id,
            phase: CyclePhase::LoadingRequests,
            aborted: None,
            issued: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            rotations: Vec::new(),
        }
    }

    fn abort(&mut self, reason: impl fmt::Display) {
        error!(phase = %self.phase, reason = %reason, "Renewal cycle aborted");
        self.aborted = Some(reason.to_string());
    }

    pub fn is_complete(&self) -> bool {
        self.phase == CyclePhase::Done
    }

    /// Cycle completed, every due certificate was issued and rotated
    pub fn is_clean(&self) -> bool {
        self.is_complete()
            && self.failed.is_empty()
            && self.rotations.iter().all(RotationOutcome::is_complete)
    }
}

/// Errors building an orchestrator from settings
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Failed to create data directory '{path}': {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Hetzner Cloud API token is not set (CERTWARDEN_HETZNER_API_TOKEN)")]
    MissingToken,

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    LoadBalancer(#[from] LbApiError),
}

/// Runs renewal cycles
#[derive(Debug, Clone)]
pub struct RenewalOrchestrator {
    paths: Paths,
    options: ConnectOptions,
    renewal_lead_time: chrono::Duration,
    connector: Arc<dyn AcmeConnector>,
    credentials: Arc<dyn DnsCredentialStore>,
    solver: Arc<dyn Dns01Solver>,
    propagator: RotationPropagator,
}

impl RenewalOrchestrator {
    pub fn new(
        settings: &Settings,
        connector: Arc<dyn AcmeConnector>,
        credentials: Arc<dyn DnsCredentialStore>,
        solver: Arc<dyn Dns01Solver>,
        load_balancers: Arc<dyn LoadBalancerApi>,
    ) -> Self {
        Self {
            paths: settings.paths(),
            options: ConnectOptions {
                directory_url: settings.ca_url.clone(),
                key_type: settings.key_type,
                propagation_delay: settings.dns_propagation_delay(),
                order_timeout: settings.acme_timeout(),
            },
            renewal_lead_time: chrono::Duration::days(i64::from(settings.renew_after_days)),
            connector,
            credentials,
            solver,
            propagator: RotationPropagator::new(load_balancers, settings.superseded_suffix.clone()),
        }
    }

    /// Wire the production adapters: instant-acme, acme-dns and Hetzner Cloud
    ///
    /// Creates the data directory if needed.
    pub fn from_settings(settings: &Settings) -> Result<Self, SetupError> {
        let paths = settings.paths();
        fs::create_dir_all(&paths.data_dir).map_err(|source| SetupError::DataDir {
            path: paths.data_dir.clone(),
            source,
        })?;

        let token = settings
            .hetzner_api_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(SetupError::MissingToken)?;

        let credentials: Arc<dyn DnsCredentialStore> =
            Arc::new(FileCredentialStore::open(&paths.dns_credentials)?);
        let dns_client = AcmeDnsClient::new(&settings.acme_dns_url, settings.api_timeout())?;
        let solver: Arc<dyn Dns01Solver> =
            Arc::new(AcmeDnsSolver::new(Arc::clone(&credentials), dns_client));
        let load_balancers: Arc<dyn LoadBalancerApi> = Arc::new(HetznerCloudClient::new(
            token,
            &settings.hetzner_api_url,
            settings.api_timeout(),
        )?);

        Ok(Self::new(
            settings,
            Arc::new(InstantAcmeConnector::new()),
            credentials,
            solver,
            load_balancers,
        ))
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Run one cycle at the current time
    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle, evaluating renewals against `now`
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        let cycle_id = CycleId::new();
        let span = info_span!("cycle", cycle_id = %cycle_id);
        self.cycle(cycle_id, now).instrument(span).await
    }

    async fn cycle(&self, cycle_id: CycleId, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::new(cycle_id);
        info!(data_dir = %self.paths.data_dir.display(), "Starting renewal cycle");

        let requests = match self.load_requests() {
            Ok(requests) => requests,
            Err(e) => {
                report.abort(e);
                return report;
            }
        };

        report.phase = CyclePhase::LoadingLedger;
        let mut ledger =
            CertificateLedger::new(&self.paths.certificates, &self.paths.certificates_backup);
        if let Err(e) = ledger.load() {
            if e.is_not_found() {
                info!(path = %ledger.path().display(), "No certificate ledger yet, starting empty");
            } else {
                warn!(
                    path = %ledger.path().display(),
                    error = %e,
                    "Certificate ledger unreadable, starting empty"
                );
            }
        }
        let accounts = match AccountStore::open(&self.paths.accounts) {
            Ok(accounts) => accounts,
            Err(e) => {
                report.abort(format!("account ledger: {}", e));
                return report;
            }
        };

        report.phase = CyclePhase::BackingUp;
        if let Err(e) = ledger.backup() {
            report.abort(format!("certificate ledger backup: {}", e));
            return report;
        }

        report.phase = CyclePhase::Issuing;
        let driver = IssuanceDriver::new(
            accounts,
            Arc::clone(&self.connector),
            Arc::clone(&self.credentials),
            Arc::clone(&self.solver),
            self.options.clone(),
            self.renewal_lead_time,
        );

        let mut units = JoinSet::new();
        for request in requests {
            let name = request.logical_name();
            match RenewalDecision::evaluate(ledger.get(&name), now) {
                RenewalDecision::Skip { next_update } => {
                    info!(name = %name, next_update = %next_update, "Certificate is not due, skipping");
                    report.skipped.push(name);
                }
                decision => {
                    info!(name = %name, decision = ?decision, domains = ?request.domains(), "Renewing certificate");
                    let span = info_span!("issue", name = %name);
                    units.spawn(issue_isolated(driver.clone(), request, now).instrument(span));
                }
            }
        }

        report.phase = CyclePhase::Merging;
        let mut accepted = Vec::new();
        while let Some(joined) = units.join_next().await {
            let (name, result) = match joined {
                Ok(unit) => unit,
                Err(e) => {
                    // The unit itself traps panics; this only fires on cancellation.
                    error!(error = %e, "Issuance task ended unexpectedly");
                    continue;
                }
            };
            match result {
                Ok(record) => {
                    info!(
                        name = %name,
                        next_update = %record.next_update,
                        "Certificate issued"
                    );
                    ledger.set(record.clone());
                    accepted.push(record);
                    report.issued.push(name);
                }
                Err(e) => {
                    error!(name = %name, error = %e, "Certificate issuance failed");
                    report.failed.push(IssuanceFailure { name, error: e });
                }
            }
        }

        report.phase = CyclePhase::Saving;
        if accepted.is_empty() {
            debug!("No new certificates, ledger unchanged");
        } else if let Err(e) = ledger.save() {
            report.abort(format!("certificate ledger save: {}", e));
            return report;
        }

        report.phase = CyclePhase::Propagating;
        if !accepted.is_empty() {
            report.rotations = self.propagator.propagate(&accepted).await;
        }

        report.phase = CyclePhase::Done;
        info!(
            issued = report.issued.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            rotated = report.rotations.iter().filter(|o| o.is_live()).count(),
            "Renewal cycle finished"
        );
        report
    }

    fn load_requests(&self) -> Result<Vec<CertificateRequest>, ConfigError> {
        let requests = load_requests(&self.paths.requests)?;
        debug!(requests = requests.len(), "Loaded certificate requests");
        Ok(requests)
    }
}

/// Issue one certificate on its own task so a panic stays contained
async fn issue_isolated(
    driver: IssuanceDriver,
    request: CertificateRequest,
    now: DateTime<Utc>,
) -> (LogicalName, Result<CertificateRecord, String>) {
    let name = request.logical_name();
    let span = tracing::Span::current();
    let handle =
        tokio::spawn(async move { driver.issue(&request, now).await }.instrument(span));

    let result = match handle.await {
        Ok(result) => result.map_err(|e: AcmeError| e.to_string()),
        Err(e) if e.is_panic() => Err("issuance task panicked".to_string()),
        Err(e) => Err(format!("issuance task failed: {}", e)),
    };
    (name, result)
}
