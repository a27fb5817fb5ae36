//! Integration tests for the acme-dns DNS-01 backend
//!
//! Uses wiremock to stand in for the acme-dns `/update` endpoint.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use certwarden::acme::{
    AcmeDnsClient, AcmeDnsSolver, Dns01Solver, DnsCredentialStore, DnsCredentials, DnsError,
    FileCredentialStore,
};

fn credentials() -> DnsCredentials {
    DnsCredentials {
        username: "c36f50e8-4632-44f0-83fe-e070fef28a10".to_string(),
        password: "htB9mR9DYgcu9bX_afHF62erXaH2TS7bg9KW3F7Z".to_string(),
        full_domain: "d420c923-bbd7-4056-ab64-c3ca54c9b3cf.auth.example.org".to_string(),
        sub_domain: "d420c923-bbd7-4056-ab64-c3ca54c9b3cf".to_string(),
    }
}

fn client(server: &MockServer) -> AcmeDnsClient {
    AcmeDnsClient::new(&server.uri(), Duration::from_secs(5)).unwrap()
}

mod update_endpoint {
    use super::*;

    #[tokio::test]
    async fn test_update_sends_credentials_and_value() {
        let server = MockServer::start().await;
        let creds = credentials();

        Mock::given(method("POST"))
            .and(path("/update"))
            .and(header("X-Api-User", creds.username.as_str()))
            .and(header("X-Api-Key", creds.password.as_str()))
            .and(body_json(serde_json::json!({
                "subdomain": creds.sub_domain,
                "txt": "LPsIwTo7o8BoG0-vjCyGQGBWSVIPxI-i_X336eUOQZo"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "txt": "LPsIwTo7o8BoG0-vjCyGQGBWSVIPxI-i_X336eUOQZo"
            })))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .update_txt(&creds, "LPsIwTo7o8BoG0-vjCyGQGBWSVIPxI-i_X336eUOQZo")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/update"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server)
            .update_txt(&credentials(), "value")
            .await
            .unwrap_err();

        assert!(matches!(err, DnsError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_bad_request_reports_body() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/update"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(serde_json::json!({
                    "error": "bad_txt"
                })),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .update_txt(&credentials(), "short")
            .await
            .unwrap_err();

        match err {
            DnsError::ApiRequest(message) => assert!(message.contains("bad_txt")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/update"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = AcmeDnsClient::new(&server.uri(), Duration::from_millis(200)).unwrap();
        let err = client.update_txt(&credentials(), "value").await.unwrap_err();

        assert!(matches!(err, DnsError::Timeout { .. }));
    }
}

mod solver {
    use super::*;

    #[tokio::test]
    async fn test_present_uses_credentials_stored_for_domain() {
        let server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FileCredentialStore::open(temp_dir.path().join("acme-dns.json")).unwrap());
        store.put("Shop.Example.com", &credentials()).unwrap();

        Mock::given(method("POST"))
            .and(path("/update"))
            .and(header("X-Api-User", credentials().username.as_str()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let solver = AcmeDnsSolver::new(store as Arc<dyn DnsCredentialStore>, client(&server));
        solver.present("shop.example.com", "value").await.unwrap();
        solver.cleanup("shop.example.com", "value").await.unwrap();
    }

    #[tokio::test]
    async fn test_present_without_credentials_fails_before_any_request() {
        let server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FileCredentialStore::open(temp_dir.path().join("acme-dns.json")).unwrap());

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let solver = AcmeDnsSolver::new(store as Arc<dyn DnsCredentialStore>, client(&server));
        let err = solver.present("unknown.example.com", "value").await.unwrap_err();

        assert!(matches!(err, DnsError::NoCredentials { .. }));
    }

    #[tokio::test]
    async fn test_credentials_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("acme-dns.json");

        let store = FileCredentialStore::open(&path).unwrap();
        store.put("a.example.com", &credentials()).unwrap();
        store.put("*.a.example.com", &credentials()).unwrap();
        drop(store);

        let reopened = FileCredentialStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("A.EXAMPLE.COM").unwrap(), Some(credentials()));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["a.example.com"]["full_domain"], credentials().full_domain);
    }
}
