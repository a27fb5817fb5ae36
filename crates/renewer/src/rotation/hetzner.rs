//! Hetzner Cloud load balancer API client
//!
//! API documentation: <https://docs.hetzner.cloud/>

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::provider::{
    LbApiError, LbResult, LoadBalancer, LoadBalancerApi, NewCertificate, RemoteCertificate,
};

/// Hetzner Cloud API client
#[derive(Clone)]
pub struct HetznerCloudClient {
    client: Client,
    token: String,
    base_url: String,
    timeout: Duration,
}

impl HetznerCloudClient {
    /// Create a new client
    ///
    /// # Arguments
    ///
    /// * `token` - Hetzner Cloud API token (read/write)
    /// * `base_url` - API base, normally `https://api.hetzner.cloud/v1`
    /// * `timeout` - Request timeout
    pub fn new(token: &str, base_url: &str, timeout: Duration) -> LbResult<Self> {
        if token.trim().is_empty() {
            return Err(LbApiError::Configuration(
                "Hetzner Cloud API token is empty".to_string(),
            ));
        }

        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            LbApiError::Configuration(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            token: token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> LbResult<Response> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LbApiError::Timeout {
                        elapsed_secs: self.timeout.as_secs(),
                    }
                } else {
                    LbApiError::Request(format!("Failed to {}: {}", operation, e))
                }
            })?;

        let status = response.status();
        trace!(operation = %operation, status = %status, "Hetzner API response");

        if status == StatusCode::UNAUTHORIZED {
            return Err(LbApiError::Authentication(
                "Invalid Hetzner Cloud API token".to_string(),
            ));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("ratelimit-reset")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
                .map(|reset| (reset - chrono::Utc::now().timestamp()).max(0) as u64)
                .unwrap_or(0);
            return Err(LbApiError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (code, message) = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(parsed) => (parsed.error.code, parsed.error.message),
                Err(_) => ("unknown".to_string(), body),
            };
            return Err(LbApiError::Api {
                status: status.as_u16(),
                code,
                message: format!("{}: {}", operation, message),
            });
        }

        Ok(response)
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: Response, operation: &str) -> LbResult<T> {
        response.json().await.map_err(|e| {
            LbApiError::Request(format!("Failed to parse {} response: {}", operation, e))
        })
    }
}

impl fmt::Debug for HetznerCloudClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HetznerCloudClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl LoadBalancerApi for HetznerCloudClient {
    fn name(&self) -> &'static str {
        "hetzner"
    }

    async fn get_load_balancer(&self, name: &str) -> LbResult<Option<LoadBalancer>> {
        let request = self
            .client
            .get(self.url("/load_balancers"))
            .query(&[("name", name)]);
        let response = self.send(request, "list load balancers").await?;
        let body: LoadBalancersResponse = Self::json(response, "load balancers").await?;

        Ok(body
            .load_balancers
            .into_iter()
            .find(|lb| lb.name == name)
            .map(|lb| LoadBalancer {
                id: lb.id,
                name: lb.name,
            }))
    }

    async fn get_certificate(&self, name: &str) -> LbResult<Option<RemoteCertificate>> {
        let request = self
            .client
            .get(self.url("/certificates"))
            .query(&[("name", name)]);
        let response = self.send(request, "list certificates").await?;
        let body: CertificatesResponse = Self::json(response, "certificates").await?;

        Ok(body
            .certificates
            .into_iter()
            .find(|c| c.name == name)
            .map(Into::into))
    }

    async fn rename_certificate(
        &self,
        certificate: &RemoteCertificate,
        new_name: &str,
    ) -> LbResult<RemoteCertificate> {
        let request = self
            .client
            .put(self.url(&format!("/certificates/{}", certificate.id)))
            .json(&UpdateCertificateRequest { name: new_name });
        let response = self.send(request, "rename certificate").await?;
        let body: CertificateResponse = Self::json(response, "certificate").await?;

        debug!(id = certificate.id, from = %certificate.name, to = %new_name, "Renamed certificate");
        Ok(body.certificate.into())
    }

    async fn create_certificate(&self, certificate: &NewCertificate) -> LbResult<RemoteCertificate> {
        let request = self
            .client
            .post(self.url("/certificates"))
            .json(&CreateCertificateRequest {
                name: &certificate.name,
                r#type: "uploaded",
                certificate: &certificate.certificate,
                private_key: &certificate.private_key,
                labels: &certificate.labels,
            });
        let response = self.send(request, "create certificate").await?;
        let body: CertificateResponse = Self::json(response, "certificate").await?;

        debug!(id = body.certificate.id, name = %certificate.name, "Created certificate");
        Ok(body.certificate.into())
    }

    async fn update_service_certificate(
        &self,
        load_balancer: &LoadBalancer,
        port: u16,
        certificate: &RemoteCertificate,
    ) -> LbResult<()> {
        let request = self
            .client
            .post(self.url(&format!(
                "/load_balancers/{}/actions/update_service",
                load_balancer.id
            )))
            .json(&UpdateServiceRequest {
                listen_port: port,
                http: UpdateServiceHttp {
                    certificates: vec![certificate.id],
                },
            });
        self.send(request, "update load balancer service").await?;

        debug!(
            load_balancer = %load_balancer.name,
            port,
            certificate_id = certificate.id,
            "Updated load balancer service certificate"
        );
        Ok(())
    }

    async fn delete_certificate(&self, certificate: &RemoteCertificate) -> LbResult<()> {
        let request = self
            .client
            .delete(self.url(&format!("/certificates/{}", certificate.id)));
        self.send(request, "delete certificate").await?;

        debug!(id = certificate.id, name = %certificate.name, "Deleted certificate");
        Ok(())
    }
}

// ============================================================================
// API types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct LoadBalancersResponse {
    load_balancers: Vec<ApiLoadBalancer>,
}

#[derive(Debug, Deserialize)]
struct ApiLoadBalancer {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CertificatesResponse {
    certificates: Vec<ApiCertificate>,
}

#[derive(Debug, Deserialize)]
struct CertificateResponse {
    certificate: ApiCertificate,
}

#[derive(Debug, Deserialize)]
struct ApiCertificate {
    id: u64,
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

impl From<ApiCertificate> for RemoteCertificate {
    fn from(c: ApiCertificate) -> Self {
        Self {
            id: c.id,
            name: c.name,
            labels: c.labels,
        }
    }
}

#[derive(Serialize)]
struct UpdateCertificateRequest<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct CreateCertificateRequest<'a> {
    name: &'a str,
    r#type: &'static str,
    certificate: &'a str,
    private_key: &'a str,
    labels: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct UpdateServiceRequest {
    listen_port: u16,
    http: UpdateServiceHttp,
}

#[derive(Serialize)]
struct UpdateServiceHttp {
    certificates: Vec<u64>,
}
