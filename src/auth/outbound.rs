//! Outbound credential attachment for downstream API calls

use crate::auth::local_credentials::LocalCredentialManager;
use crate::auth::transport::TransportMode;
use crate::auth::user_context::VerifiedIdentity;
use crate::error::{BrokerError, Result};
use reqwest::{header, Client, Method, Response, StatusCode};
use secrecy::{ExposeSecret, Secret};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Where downstream credentials come from
#[derive(Clone)]
pub enum OutboundCredentials {
    /// The cached device-code credential of the local user
    Local(LocalCredentialManager),
    /// The caller's own bearer token, taken from the verified identity
    Remote,
}

impl OutboundCredentials {
    pub fn mode(&self) -> TransportMode {
        match self {
            OutboundCredentials::Local(_) => TransportMode::Local,
            OutboundCredentials::Remote => TransportMode::Remote,
        }
    }

    /// Bearer token for one downstream call
    pub async fn bearer(&self, identity: Option<&VerifiedIdentity>) -> Result<Secret<String>> {
        match self {
            OutboundCredentials::Local(manager) => manager.get_token().await,
            OutboundCredentials::Remote => identity
                .map(|identity| identity.token().clone())
                .ok_or_else(|| {
                    BrokerError::missing_token("No verified identity in the request context")
                }),
        }
    }
}

impl std::fmt::Debug for OutboundCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OutboundCredentials::{}", self.mode())
    }
}

/// Request forwarded to the downstream API
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path and optional query, relative to the API base URL
    pub path: String,
    pub content_type: Option<String>,
    pub body: Option<Vec<u8>>,
}

impl OutboundRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            content_type: None,
            body: None,
        }
    }
}

/// HTTP client for the downstream API
#[derive(Debug, Clone)]
pub struct DownstreamClient {
    client: Client,
    base_url: String,
    credentials: OutboundCredentials,
}

impl DownstreamClient {
    pub fn new(base_url: &str, credentials: OutboundCredentials, timeout: Duration) -> Result<Self> {
        Url::parse(base_url)
            .map_err(|e| BrokerError::config(format!("Invalid API base URL '{}': {}", base_url, e)))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn credentials(&self) -> &OutboundCredentials {
        &self.credentials
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn dispatch(&self, request: &OutboundRequest, token: &Secret<String>) -> Result<Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url_for(&request.path))
            .bearer_auth(token.expose_secret());
        if let Some(ref content_type) = request.content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type.as_str());
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }
        builder.send().await.map_err(|e| {
            warn!("Downstream request failed: {}", e);
            BrokerError::Http(e)
        })
    }

    /// Send a request with the credential for the active transport mode.
    ///
    /// In local mode a `401` triggers one forced refresh and one retry. The
    /// caller's token in remote mode is never replaced or retried.
    pub async fn send(
        &self,
        request: OutboundRequest,
        identity: Option<&VerifiedIdentity>,
    ) -> Result<Response> {
        let token = self.credentials.bearer(identity).await?;
        debug!(method = %request.method, path = %request.path, mode = %self.credentials.mode(), "Calling downstream API");
        let response = self.dispatch(&request, &token).await?;

        match self.credentials {
            OutboundCredentials::Local(ref manager) if response.status() == StatusCode::UNAUTHORIZED => {
                info!("Downstream API rejected the local credential, refreshing once");
                let replacement = manager.force_refresh(&token).await?;
                self.dispatch(&request, &replacement).await
            }
            _ => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::system_clock;
    use crate::auth::credential_store::{CachedToken, CredentialStore};
    use crate::auth::test_helpers::FakeProvider;
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::TempDir;
    use wiremock::matchers::{header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn local_manager(dir: &TempDir, provider: Arc<FakeProvider>, access: &str) -> LocalCredentialManager {
        let store = Arc::new(CredentialStore::new(dir.path().join("cache.json")));
        store
            .lock()
            .await
            .unwrap()
            .put(CachedToken {
                access_token: Secret::new(access.to_string()),
                refresh_token: Some(Secret::new("rt".to_string())),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                scope: None,
            })
            .await
            .unwrap();
        LocalCredentialManager::new(store, provider, system_clock(), chrono::Duration::minutes(5))
    }

    #[tokio::test]
    async fn test_local_mode_retries_once_after_401() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(header_is("authorization", "Bearer revoked"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(header_is("authorization", "Bearer refreshed-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        let manager = local_manager(&dir, provider.clone(), "revoked").await;
        let client = DownstreamClient::new(
            &server.uri(),
            OutboundCredentials::Local(manager),
            Duration::from_secs(5),
        )
        .unwrap();

        let response = client.send(OutboundRequest::get("/items"), None).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(provider.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_remote_mode_never_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = DownstreamClient::new(
            &server.uri(),
            OutboundCredentials::Remote,
            Duration::from_secs(5),
        )
        .unwrap();
        let identity = VerifiedIdentity::new(
            "subject-1".to_string(),
            "object-1".to_string(),
            Some("user@example.com".to_string()),
            Some("tenant-1".to_string()),
            None,
            Utc::now() + chrono::Duration::hours(1),
            Secret::new("caller-token".to_string()),
        );

        let response = client
            .send(OutboundRequest::get("items"), Some(&identity))
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn test_remote_mode_without_identity() {
        let client = DownstreamClient::new(
            "http://127.0.0.1:9",
            OutboundCredentials::Remote,
            Duration::from_secs(1),
        )
        .unwrap();
        let err = client.send(OutboundRequest::get("items"), None).await.unwrap_err();
        assert!(matches!(err, BrokerError::MissingToken { .. }));
    }

    #[tokio::test]
    async fn test_remote_mode_forwards_caller_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .and(header_is("authorization", "Bearer caller-token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = DownstreamClient::new(
            &format!("{}/", server.uri()),
            OutboundCredentials::Remote,
            Duration::from_secs(5),
        )
        .unwrap();
        let identity = VerifiedIdentity::new(
            "subject-1".to_string(),
            "object-1".to_string(),
            None,
            None,
            None,
            Utc::now() + chrono::Duration::hours(1),
            Secret::new("caller-token".to_string()),
        );
        let response = client.send(OutboundRequest::get("/me"), Some(&identity)).await.unwrap();
        assert_eq!(response.status(), 200);
    }
}
