//! ACME capability
//!
//! The issuance driver talks to the CA through [`AcmeConnector`] and
//! [`AcmeSession`]. [`InstantAcmeConnector`] is the production
//! implementation on top of `instant-acme`; tests substitute in-memory fakes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use instant_acme::{
    Account as AcmeAccount, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, KeyPair, RsaKeySize};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use certwarden_config::CertificateKeyType;

use super::account::Account;
use super::challenge::Dns01Solver;
use super::error::AcmeError;
use super::storage::CertificateBundle;

/// Delay between order status polls
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Parameters fixed for the lifetime of one session
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// CA directory URL
    pub directory_url: String,
    /// Key type of the issued certificate (independent of the account key)
    pub key_type: CertificateKeyType,
    /// Wait between publishing DNS-01 values and asking the CA to validate
    pub propagation_delay: Duration,
    /// Upper bound for validation and issuance polling
    pub order_timeout: Duration,
}

/// Builds sessions bound to one account
#[async_trait]
pub trait AcmeConnector: Send + Sync + fmt::Debug {
    async fn connect(
        &self,
        account: &Account,
        options: &ConnectOptions,
    ) -> Result<Box<dyn AcmeSession>, AcmeError>;
}

/// CA operations for one account
#[async_trait]
pub trait AcmeSession: Send {
    /// Bind the solver used for every DNS-01 challenge of this session
    fn set_dns01_solver(&mut self, solver: Arc<dyn Dns01Solver>);

    /// Register the account, agreeing to the terms of service
    ///
    /// Returns the registration resource to persist with the account.
    async fn register(&mut self) -> Result<serde_json::Value, AcmeError>;

    /// Order one certificate covering all `domains`
    async fn obtain(&mut self, domains: &[String]) -> Result<CertificateBundle, AcmeError>;
}

/// `instant-acme` backed connector
#[derive(Debug, Clone, Default)]
pub struct InstantAcmeConnector;

impl InstantAcmeConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AcmeConnector for InstantAcmeConnector {
    async fn connect(
        &self,
        account: &Account,
        options: &ConnectOptions,
    ) -> Result<Box<dyn AcmeSession>, AcmeError> {
        let acme_account = match &account.registration {
            Some(registration) => {
                let credentials: AccountCredentials =
                    serde_json::from_value(registration.clone()).map_err(|e| {
                        AcmeError::Registration {
                            email: account.email.clone(),
                            message: format!("stored registration is unusable: {}", e),
                        }
                    })?;
                let restored = AcmeAccount::from_credentials(credentials)
                    .await
                    .map_err(|e| AcmeError::Registration {
                        email: account.email.clone(),
                        message: e.to_string(),
                    })?;
                debug!(email = %account.email, "Restored ACME account from registration");
                Some(restored)
            }
            None => None,
        };

        Ok(Box::new(InstantAcmeSession {
            email: account.email.clone(),
            options: options.clone(),
            account: acme_account,
            solver: None,
        }))
    }
}

struct InstantAcmeSession {
    email: String,
    options: ConnectOptions,
    account: Option<AcmeAccount>,
    solver: Option<Arc<dyn Dns01Solver>>,
}

/// A DNS-01 value published for one authorization
struct PublishedChallenge {
    domain: String,
    value: String,
    url: String,
}

#[async_trait]
impl AcmeSession for InstantAcmeSession {
    fn set_dns01_solver(&mut self, solver: Arc<dyn Dns01Solver>) {
        self.solver = Some(solver);
    }

    async fn register(&mut self) -> Result<serde_json::Value, AcmeError> {
        info!(
            email = %self.email,
            directory = %self.options.directory_url,
            "Creating new ACME account"
        );

        let contact = format!("mailto:{}", self.email);
        let (account, credentials) = AcmeAccount::create(
            &NewAccount {
                contact: &[&contact],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.options.directory_url,
            None,
        )
        .await
        .map_err(|e| AcmeError::Registration {
            email: self.email.clone(),
            message: e.to_string(),
        })?;

        let registration =
            serde_json::to_value(&credentials).map_err(|e| AcmeError::Registration {
                email: self.email.clone(),
                message: format!("failed to serialize credentials: {}", e),
            })?;

        self.account = Some(account);
        Ok(registration)
    }

    async fn obtain(&mut self, domains: &[String]) -> Result<CertificateBundle, AcmeError> {
        let account = self
            .account
            .as_ref()
            .ok_or_else(|| AcmeError::NotRegistered(self.email.clone()))?;
        let solver = self.solver.clone().ok_or(AcmeError::NoDnsSolver)?;
        let primary = domains
            .first()
            .cloned()
            .ok_or_else(|| AcmeError::OrderCreation("No domains requested".to_string()))?;

        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::Dns(d.clone())).collect();

        info!(domains = ?domains, "Creating certificate order with DNS-01 challenges");
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::OrderCreation(e.to_string()))?;

        let started = Instant::now();
        let mut published = Vec::new();
        let validated = match publish_challenges(&mut order, solver.as_ref(), &mut published).await
        {
            Ok(()) => validate_challenges(&mut order, &published, &self.options, started).await,
            Err(e) => Err(e),
        };

        for challenge in &published {
            if let Err(e) = solver.cleanup(&challenge.domain, &challenge.value).await {
                warn!(domain = %challenge.domain, error = %e, "DNS-01 cleanup failed");
            }
        }
        validated?;

        let key = generate_certificate_key(self.options.key_type)?;
        let csr = CertificateParams::new(domains.to_vec())?.serialize_request(&key)?;

        if order.state().status != OrderStatus::Valid {
            order
                .finalize(csr.der())
                .await
                .map_err(|e| AcmeError::Finalization(e.to_string()))?;
        }

        let chain = loop {
            match order.certificate().await {
                Ok(Some(chain)) => break chain,
                Ok(None) => {
                    if started.elapsed() > self.options.order_timeout {
                        return Err(AcmeError::Timeout {
                            operation: "waiting for certificate".to_string(),
                            elapsed: started.elapsed(),
                        });
                    }
                    trace!(domain = %primary, "Certificate not yet available");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(AcmeError::Finalization(e.to_string())),
            }
        };

        let issuer = split_issuer_chain(&chain)?;
        let cert_url = order.state().certificate.clone().unwrap_or_default();
        match leaf_not_after(&chain) {
            Ok(expires) => info!(domain = %primary, expires = %expires, "Certificate issued"),
            Err(e) => warn!(domain = %primary, error = %e, "Issued certificate has no readable expiry"),
        }

        Ok(CertificateBundle {
            domain: primary,
            cert_stable_url: cert_url.clone(),
            cert_url,
            private_key: key.serialize_pem(),
            certificate: chain,
            issuer_certificate: issuer,
            csr: csr.pem()?,
        })
    }
}

/// Publish a DNS-01 value for every pending authorization
///
/// Values are appended to `published` as they go out, so a failure part way
/// through still leaves the caller everything it must clean up.
async fn publish_challenges(
    order: &mut Order,
    solver: &dyn Dns01Solver,
    published: &mut Vec<PublishedChallenge>,
) -> Result<(), AcmeError> {
    let authorizations = order.authorizations().await?;

    for authz in authorizations {
        #[allow(unreachable_patterns)]
        let domain = match &authz.identifier {
            Identifier::Dns(domain) => domain.clone(),
            _ => continue,
        };

        match authz.status {
            AuthorizationStatus::Valid => {
                debug!(domain = %domain, "Authorization already valid");
                continue;
            }
            AuthorizationStatus::Pending => {}
            status => {
                return Err(AcmeError::ChallengeValidation {
                    domain,
                    message: format!("authorization is {:?}", status),
                })
            }
        }

        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::Dns01)
            .ok_or_else(|| AcmeError::NoDns01Challenge(domain.clone()))?;

        let value = order.key_authorization(challenge).dns_value();
        solver.present(&domain, &value).await?;

        published.push(PublishedChallenge {
            domain,
            value,
            url: challenge.url.clone(),
        });
    }

    Ok(())
}

/// Mark challenges ready and wait for the order to leave `pending`
async fn validate_challenges(
    order: &mut Order,
    challenges: &[PublishedChallenge],
    options: &ConnectOptions,
    started: Instant,
) -> Result<(), AcmeError> {
    if challenges.is_empty() {
        return Ok(());
    }

    debug!(
        delay_secs = options.propagation_delay.as_secs(),
        "Waiting for DNS-01 records to propagate"
    );
    tokio::time::sleep(options.propagation_delay).await;

    for challenge in challenges {
        order
            .set_challenge_ready(&challenge.url)
            .await
            .map_err(|e| AcmeError::ChallengeValidation {
                domain: challenge.domain.clone(),
                message: e.to_string(),
            })?;
    }

    loop {
        let state = order.refresh().await?;
        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => {
                debug!("Order is ready for finalization");
                return Ok(());
            }
            OrderStatus::Invalid => {
                let message = state
                    .error
                    .as_ref()
                    .map(|e| format!("{:?}", e))
                    .unwrap_or_else(|| "order became invalid".to_string());
                let domain = challenges
                    .first()
                    .map(|c| c.domain.clone())
                    .unwrap_or_default();
                return Err(AcmeError::ChallengeValidation { domain, message });
            }
            OrderStatus::Pending | OrderStatus::Processing => {
                if started.elapsed() > options.order_timeout {
                    return Err(AcmeError::Timeout {
                        operation: "waiting for order validation".to_string(),
                        elapsed: started.elapsed(),
                    });
                }
                trace!(status = ?state.status, "Order not ready yet");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

fn generate_certificate_key(key_type: CertificateKeyType) -> Result<KeyPair, AcmeError> {
    let key = match key_type {
        CertificateKeyType::Rsa2048 => {
            KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, RsaKeySize::_2048)?
        }
        CertificateKeyType::Rsa3072 => {
            KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, RsaKeySize::_3072)?
        }
        CertificateKeyType::Rsa4096 => {
            KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, RsaKeySize::_4096)?
        }
        CertificateKeyType::Ec256 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?,
        CertificateKeyType::Ec384 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)?,
    };
    Ok(key)
}

/// Everything after the leaf certificate of a PEM chain
pub fn split_issuer_chain(chain: &str) -> Result<String, AcmeError> {
    const END_MARKER: &str = "-----END CERTIFICATE-----";

    let blocks = pem::parse_many(chain)
        .map_err(|e| AcmeError::CertificateParse(format!("Failed to parse PEM: {}", e)))?;
    if blocks.is_empty() {
        return Err(AcmeError::CertificateParse(
            "Certificate chain is empty".to_string(),
        ));
    }

    let issuer = chain
        .find(END_MARKER)
        .map(|pos| chain[pos + END_MARKER.len()..].trim_start())
        .unwrap_or_default();
    Ok(issuer.to_string())
}

/// Expiry of the first certificate in a PEM chain
pub fn leaf_not_after(chain: &str) -> Result<DateTime<Utc>, AcmeError> {
    use x509_parser::prelude::*;

    let (_, pem) = x509_parser::pem::parse_x509_pem(chain.as_bytes())
        .map_err(|e| AcmeError::CertificateParse(format!("Failed to parse PEM: {}", e)))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| AcmeError::CertificateParse(format!("Failed to parse certificate: {}", e)))?;

    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| AcmeError::CertificateParse("Invalid expiry timestamp".to_string()))
}
