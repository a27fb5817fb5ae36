//! Per-request issuance workflow

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use certwarden_config::CertificateRequest;

use super::account::{Account, AccountStore};
use super::challenge::{Dns01Solver, DnsCredentialStore, DnsCredentials};
use super::client::{AcmeConnector, ConnectOptions};
use super::error::AcmeError;
use super::storage::CertificateRecord;

/// Obtains one certificate for one request
///
/// Resolves or creates the ACME account for the request's email, publishes
/// the request's acme-dns credentials, registers the account when needed
/// and orders the certificate for the full domain set.
#[derive(Debug, Clone)]
pub struct IssuanceDriver {
    accounts: AccountStore,
    connector: Arc<dyn AcmeConnector>,
    credentials: Arc<dyn DnsCredentialStore>,
    solver: Arc<dyn Dns01Solver>,
    options: ConnectOptions,
    renewal_lead_time: Duration,
}

impl IssuanceDriver {
    pub fn new(
        accounts: AccountStore,
        connector: Arc<dyn AcmeConnector>,
        credentials: Arc<dyn DnsCredentialStore>,
        solver: Arc<dyn Dns01Solver>,
        options: ConnectOptions,
        renewal_lead_time: Duration,
    ) -> Self {
        Self {
            accounts,
            connector,
            credentials,
            solver,
            options,
            renewal_lead_time,
        }
    }

    pub fn accounts(&self) -> &AccountStore {
        &self.accounts
    }

    /// Run the workflow; any failing step aborts the request
    pub async fn issue(
        &self,
        request: &CertificateRequest,
        now: DateTime<Utc>,
    ) -> Result<CertificateRecord, AcmeError> {
        let (mut account, needs_registration) = self.resolve_account(&request.email)?;

        let mut session = self.connector.connect(&account, &self.options).await?;

        let credentials = DnsCredentials::from(&request.acme_dns);
        for domain in request.domains() {
            self.credentials.put(domain, &credentials)?;
        }
        session.set_dns01_solver(Arc::clone(&self.solver));

        if needs_registration {
            let registration = session.register().await?;
            account.registration = Some(registration);
            self.accounts.register(account)?;
            info!(email = %request.email, "Registered ACME account");
        }

        let bundle = session.obtain(request.domains()).await?;
        Ok(CertificateRecord::issued(
            request,
            bundle,
            now + self.renewal_lead_time,
        ))
    }

    fn resolve_account(&self, email: &str) -> Result<(Account, bool), AcmeError> {
        match self.accounts.get(email) {
            Some(account) => {
                let needs_registration = !account.is_registered();
                debug!(email = %email, needs_registration, "Using stored ACME account");
                Ok((account.decode_key()?, needs_registration))
            }
            None => {
                debug!(email = %email, "No ACME account stored, generating a new key");
                Ok((Account::generate(email)?, true))
            }
        }
    }
}
