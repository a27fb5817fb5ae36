//! Shared test utilities for integration tests
//!
//! In-memory stand-ins for the CA, the DNS-01 backend and the load balancer
//! API, plus builders for requests, records and data directories.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;

use certwarden::acme::{
    Account, AcmeConnector, AcmeError, AcmeSession, CertificateBundle, CertificateRecord,
    ConnectOptions, Dns01Solver, DnsCredentialStore, DnsCredentials, DnsError,
};
use certwarden::rotation::{
    LbApiError, LbResult, LoadBalancer, LoadBalancerApi, NewCertificate, RemoteCertificate,
};
use certwarden::RenewalOrchestrator;
use certwarden_common::LogicalName;
use certwarden_config::{AcmeDnsAccount, CertificateRequest, LoadBalancerTarget, Settings};

pub const TEST_EMAIL: &str = "ops@example.com";
pub const TEST_LB: &str = "edge-lb";

// ============================================================================
// Builders
// ============================================================================

pub fn request(name: &str, domains: &[&str], port: u16) -> CertificateRequest {
    CertificateRequest {
        email: TEST_EMAIL.to_string(),
        acme_dns: AcmeDnsAccount {
            username: format!("user-{}", name),
            password: "secret".to_string(),
            full_domain: format!("{}.auth.acme-dns.io", name),
            sub_domain: name.to_string(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
        },
        target: LoadBalancerTarget {
            name: name.to_string(),
            labels: BTreeMap::from([("managed-by".to_string(), "certwarden".to_string())]),
            lb_name: TEST_LB.to_string(),
            lb_port: port,
        },
    }
}

pub fn bundle_for(domains: &[String], serial: &str) -> CertificateBundle {
    let primary = domains.first().cloned().unwrap_or_default();
    CertificateBundle {
        domain: primary.clone(),
        cert_url: format!("https://ca.test/cert/{}", serial),
        cert_stable_url: format!("https://ca.test/cert/{}", serial),
        private_key: format!("KEY {}", serial),
        certificate: format!("LEAF {} {}\nISSUER", primary, serial),
        issuer_certificate: "ISSUER".to_string(),
        csr: format!("CSR {}", serial),
    }
}

pub fn record(name: &str, domains: &[&str], port: u16, next_update: DateTime<Utc>) -> CertificateRecord {
    let request = request(name, domains, port);
    let bundle = bundle_for(request.domains(), "stored");
    CertificateRecord::issued(&request, bundle, next_update)
}

pub fn write_requests(path: &Path, requests: &[CertificateRequest]) {
    std::fs::write(path, serde_json::to_vec_pretty(requests).unwrap()).unwrap();
}

pub fn write_ledger(path: &Path, records: &[CertificateRecord]) {
    std::fs::write(path, serde_json::to_vec_pretty(records).unwrap()).unwrap();
}

pub fn read_ledger(path: &Path) -> Vec<CertificateRecord> {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

pub fn names(names: &[LogicalName]) -> Vec<&str> {
    let mut names: Vec<&str> = names.iter().map(LogicalName::as_str).collect();
    names.sort();
    names
}

// ============================================================================
// ACME fakes
// ============================================================================

/// What the scripted CA does and what it saw
#[derive(Debug, Default)]
pub struct CaState {
    pub fail_domains: Mutex<HashSet<String>>,
    pub panic_domains: Mutex<HashSet<String>>,
    pub fail_registration: Mutex<bool>,
    pub order_delay: Mutex<Duration>,
    /// Path replaced by a non-empty directory while the next order runs
    pub occupy_path: Mutex<Option<PathBuf>>,
    pub registrations: Mutex<Vec<String>>,
    /// (email, registered) per connect
    pub connects: Mutex<Vec<(String, bool)>>,
    pub orders: Mutex<Vec<Vec<String>>>,
}

/// Scripted CA
///
/// Orders succeed unless their first domain is listed in `fail_domains`
/// or `panic_domains`.
#[derive(Debug, Clone, Default)]
pub struct FakeAcmeConnector {
    pub state: Arc<CaState>,
}

impl FakeAcmeConnector {
    pub fn fail_for(&self, domain: &str) {
        self.state.fail_domains.lock().insert(domain.to_string());
    }

    pub fn panic_for(&self, domain: &str) {
        self.state.panic_domains.lock().insert(domain.to_string());
    }

    pub fn fail_registration(&self) {
        *self.state.fail_registration.lock() = true;
    }

    pub fn delay_orders(&self, delay: Duration) {
        *self.state.order_delay.lock() = delay;
    }

    /// Make `path` unwritable as a file once issuance is underway
    pub fn occupy_during_order(&self, path: &Path) {
        *self.state.occupy_path.lock() = Some(path.to_path_buf());
    }

    pub fn registrations(&self) -> Vec<String> {
        self.state.registrations.lock().clone()
    }

    pub fn connects(&self) -> Vec<(String, bool)> {
        self.state.connects.lock().clone()
    }

    pub fn orders(&self) -> Vec<Vec<String>> {
        self.state.orders.lock().clone()
    }
}

#[async_trait]
impl AcmeConnector for FakeAcmeConnector {
    async fn connect(
        &self,
        account: &Account,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn AcmeSession>, AcmeError> {
        self.state
            .connects
            .lock()
            .push((account.email.clone(), account.is_registered()));
        Ok(Box::new(FakeSession {
            email: account.email.clone(),
            ca: Arc::clone(&self.state),
            solver: None,
        }))
    }
}

struct FakeSession {
    email: String,
    ca: Arc<CaState>,
    solver: Option<Arc<dyn Dns01Solver>>,
}

#[async_trait]
impl AcmeSession for FakeSession {
    fn set_dns01_solver(&mut self, solver: Arc<dyn Dns01Solver>) {
        self.solver = Some(solver);
    }

    async fn register(&mut self) -> Result<serde_json::Value, AcmeError> {
        if *self.ca.fail_registration.lock() {
            return Err(AcmeError::Registration {
                email: self.email.clone(),
                message: "terms of service not accepted".to_string(),
            });
        }
        self.ca.registrations.lock().push(self.email.clone());
        Ok(serde_json::json!({ "id": format!("https://ca.test/acct/{}", self.email) }))
    }

    async fn obtain(&mut self, domains: &[String]) -> Result<CertificateBundle, AcmeError> {
        let solver = self.solver.clone().ok_or(AcmeError::NoDnsSolver)?;
        let primary = domains.first().cloned().unwrap_or_default();
        self.ca.orders.lock().push(domains.to_vec());

        if let Some(path) = self.ca.occupy_path.lock().take() {
            let _ = std::fs::remove_file(&path);
            std::fs::create_dir_all(path.join("occupied")).unwrap();
        }

        let delay = *self.ca.order_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.ca.panic_domains.lock().contains(&primary) {
            panic!("CA exploded while ordering {}", primary);
        }

        for domain in domains {
            solver.present(domain, "dns-value").await?;
        }

        if self.ca.fail_domains.lock().contains(&primary) {
            return Err(AcmeError::ChallengeValidation {
                domain: primary,
                message: "NXDOMAIN looking up TXT".to_string(),
            });
        }

        for domain in domains {
            solver.cleanup(domain, "dns-value").await?;
        }
        Ok(bundle_for(domains, "new"))
    }
}

// ============================================================================
// DNS-01 fakes
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, DnsCredentials>>,
}

impl MemoryCredentialStore {
    pub fn username_for(&self, domain: &str) -> Option<String> {
        self.entries
            .lock()
            .get(&domain.to_lowercase())
            .map(|c| c.username.clone())
    }
}

impl DnsCredentialStore for MemoryCredentialStore {
    fn put(&self, domain: &str, credentials: &DnsCredentials) -> Result<(), DnsError> {
        self.entries
            .lock()
            .insert(domain.to_lowercase(), credentials.clone());
        Ok(())
    }

    fn get(&self, domain: &str) -> Result<Option<DnsCredentials>, DnsError> {
        Ok(self.entries.lock().get(&domain.to_lowercase()).cloned())
    }
}

/// Solver that resolves credentials like the acme-dns one and records what
/// it published
#[derive(Debug)]
pub struct RecordingSolver {
    store: Arc<MemoryCredentialStore>,
    pub published: Mutex<Vec<(String, String)>>,
}

impl RecordingSolver {
    pub fn new(store: Arc<MemoryCredentialStore>) -> Self {
        Self {
            store,
            published: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Dns01Solver for RecordingSolver {
    async fn present(&self, domain: &str, _value: &str) -> Result<(), DnsError> {
        let credentials = self
            .store
            .get(domain)?
            .ok_or_else(|| DnsError::NoCredentials {
                domain: domain.to_string(),
            })?;
        self.published
            .lock()
            .push((domain.to_string(), credentials.username));
        Ok(())
    }

    async fn cleanup(&self, _domain: &str, _value: &str) -> Result<(), DnsError> {
        Ok(())
    }
}

// ============================================================================
// Load balancer fake
// ============================================================================

#[derive(Debug, Default)]
struct LbState {
    load_balancers: Vec<LoadBalancer>,
    certificates: Vec<RemoteCertificate>,
    /// (load balancer id, port) -> certificate id
    services: HashMap<(u64, u16), u64>,
    next_id: u64,
    calls: Vec<String>,
    failures: HashSet<(String, String)>,
    panic_next: Option<String>,
}

/// In-memory load balancer API recording every call as `"<op> <name>"`
#[derive(Debug, Default)]
pub struct FakeLoadBalancerApi {
    state: Mutex<LbState>,
}

impl FakeLoadBalancerApi {
    pub fn with_load_balancer(name: &str) -> Self {
        let api = Self::default();
        {
            let mut state = api.state.lock();
            state.next_id = 100;
            state.load_balancers.push(LoadBalancer {
                id: 1,
                name: name.to_string(),
            });
        }
        api
    }

    /// Add a certificate and attach it to `port` of the first load balancer
    pub fn install_certificate(&self, name: &str, port: u16) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.certificates.push(RemoteCertificate {
            id,
            name: name.to_string(),
            labels: BTreeMap::new(),
        });
        if let Some(lb_id) = state.load_balancers.first().map(|lb| lb.id) {
            state.services.insert((lb_id, port), id);
        }
        id
    }

    /// Make every `op` call on `name` fail
    pub fn fail_on(&self, op: &str, name: &str) {
        self.state
            .lock()
            .failures
            .insert((op.to_string(), name.to_string()));
    }

    /// Panic on the next `op` call, once
    pub fn panic_next(&self, op: &str) {
        self.state.lock().panic_next = Some(op.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn certificate_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .certificates
            .iter()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn certificate_id(&self, name: &str) -> Option<u64> {
        self.state
            .lock()
            .certificates
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id)
    }

    /// Name of the certificate serving `port` on the first load balancer
    pub fn served_certificate(&self, port: u16) -> Option<String> {
        let state = self.state.lock();
        let lb_id = state.load_balancers.first()?.id;
        let cert_id = state.services.get(&(lb_id, port))?;
        state
            .certificates
            .iter()
            .find(|c| c.id == *cert_id)
            .map(|c| c.name.clone())
    }

    fn record(&self, op: &str, name: &str) -> LbResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("{} {}", op, name));
        if state.panic_next.as_deref() == Some(op) {
            state.panic_next = None;
            drop(state);
            panic!("load balancer API exploded on {} {}", op, name);
        }
        if state.failures.contains(&(op.to_string(), name.to_string())) {
            return Err(LbApiError::Api {
                status: 500,
                code: "server_error".to_string(),
                message: format!("{} {} failed", op, name),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LoadBalancerApi for FakeLoadBalancerApi {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn get_load_balancer(&self, name: &str) -> LbResult<Option<LoadBalancer>> {
        self.record("get_load_balancer", name)?;
        Ok(self
            .state
            .lock()
            .load_balancers
            .iter()
            .find(|lb| lb.name == name)
            .cloned())
    }

    async fn get_certificate(&self, name: &str) -> LbResult<Option<RemoteCertificate>> {
        self.record("get_certificate", name)?;
        Ok(self
            .state
            .lock()
            .certificates
            .iter()
            .find(|c| c.name == name)
            .cloned())
    }

    async fn rename_certificate(
        &self,
        certificate: &RemoteCertificate,
        new_name: &str,
    ) -> LbResult<RemoteCertificate> {
        self.record("rename", &certificate.name)?;
        let mut state = self.state.lock();
        let stored = state
            .certificates
            .iter_mut()
            .find(|c| c.id == certificate.id)
            .ok_or_else(|| LbApiError::NotFound {
                kind: "certificate",
                name: certificate.name.clone(),
            })?;
        stored.name = new_name.to_string();
        Ok(stored.clone())
    }

    async fn create_certificate(&self, certificate: &NewCertificate) -> LbResult<RemoteCertificate> {
        self.record("create", &certificate.name)?;
        let mut state = self.state.lock();
        if state.certificates.iter().any(|c| c.name == certificate.name) {
            return Err(LbApiError::Api {
                status: 409,
                code: "uniqueness_error".to_string(),
                message: format!("certificate {} already exists", certificate.name),
            });
        }
        state.next_id += 1;
        let created = RemoteCertificate {
            id: state.next_id,
            name: certificate.name.clone(),
            labels: certificate.labels.clone(),
        };
        state.certificates.push(created.clone());
        Ok(created)
    }

    async fn update_service_certificate(
        &self,
        load_balancer: &LoadBalancer,
        port: u16,
        certificate: &RemoteCertificate,
    ) -> LbResult<()> {
        self.record("update_service", &certificate.name)?;
        self.state
            .lock()
            .services
            .insert((load_balancer.id, port), certificate.id);
        Ok(())
    }

    async fn delete_certificate(&self, certificate: &RemoteCertificate) -> LbResult<()> {
        self.record("delete", &certificate.name)?;
        let mut state = self.state.lock();
        if state.services.values().any(|id| *id == certificate.id) {
            return Err(LbApiError::Api {
                status: 422,
                code: "resource_in_use".to_string(),
                message: format!("certificate {} is still attached", certificate.name),
            });
        }
        state.certificates.retain(|c| c.id != certificate.id);
        Ok(())
    }
}

// ============================================================================
// Environment
// ============================================================================

/// A data directory wired to fresh fakes
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub settings: Settings,
    pub ca: FakeAcmeConnector,
    pub credentials: Arc<MemoryCredentialStore>,
    pub solver: Arc<RecordingSolver>,
    pub lb: Arc<FakeLoadBalancerApi>,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings {
            data_dir: temp_dir.path().to_path_buf(),
            ..Settings::default()
        };
        let credentials = Arc::new(MemoryCredentialStore::default());
        Self {
            temp_dir,
            settings,
            ca: FakeAcmeConnector::default(),
            solver: Arc::new(RecordingSolver::new(Arc::clone(&credentials))),
            credentials,
            lb: Arc::new(FakeLoadBalancerApi::with_load_balancer(TEST_LB)),
        }
    }

    pub fn orchestrator(&self) -> RenewalOrchestrator {
        RenewalOrchestrator::new(
            &self.settings,
            Arc::new(self.ca.clone()),
            Arc::clone(&self.credentials) as Arc<dyn DnsCredentialStore>,
            Arc::clone(&self.solver) as Arc<dyn Dns01Solver>,
            Arc::clone(&self.lb) as Arc<dyn LoadBalancerApi>,
        )
    }

    pub fn write_requests(&self, requests: &[CertificateRequest]) {
        write_requests(&self.settings.paths().requests, requests);
    }

    pub fn write_ledger(&self, records: &[CertificateRecord]) {
        write_ledger(&self.settings.paths().certificates, records);
    }

    pub fn read_ledger(&self) -> Vec<CertificateRecord> {
        read_ledger(&self.settings.paths().certificates)
    }
}
