//! Identity provider client
//!
//! Every interaction with the external OpenID Connect provider goes through the
//! [`IdentityProvider`] and [`KeySource`] traits so the credential manager, the
//! key ring and the OAuth proxy can run against fakes in tests. [`OidcProvider`]
//! is the HTTP implementation.

use crate::auth::secret_serde::{option_secret_string, secret_string};
use crate::config::IdentityConfig;
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Grant type for RFC 8628 token polling
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

fn user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Device authorization response from the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    /// Device verification code for polling
    pub device_code: String,
    /// Human-readable user code
    pub user_code: String,
    /// URI where the user signs in
    pub verification_uri: String,
    /// Optional URI with the user code embedded
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    /// Device code lifetime in seconds
    pub expires_in: u64,
    /// Polling interval in seconds
    #[serde(default)]
    pub interval: Option<u64>,
    /// Provider-formatted instructions, when the provider sends them
    #[serde(default)]
    pub message: Option<String>,
}

impl DeviceAuthorization {
    /// Instructions shown to the user while polling
    pub fn user_instructions(&self) -> String {
        if let Some(ref message) = self.message {
            return message.clone();
        }
        match self.verification_uri_complete {
            Some(ref complete) => format!(
                "To sign in, open {} (or visit {} and enter the code {})",
                complete, self.verification_uri, self.user_code
            ),
            None => format!(
                "To sign in, open {} and enter the code {}",
                self.verification_uri, self.user_code
            ),
        }
    }
}

/// Successful token endpoint response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    #[serde(with = "secret_string")]
    pub access_token: Secret<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default, with = "option_secret_string", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Outcome of one device token poll
#[derive(Debug, Clone)]
pub enum DevicePoll {
    Granted(TokenGrant),
    Pending,
    SlowDown,
    Denied,
    Expired,
}

/// OAuth error body (RFC 6749 section 5.2)
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Token-issuing side of the identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Start a device-authorization grant
    async fn start_device_authorization(&self) -> Result<DeviceAuthorization>;

    /// Poll the token endpoint once for a device code
    async fn poll_device_token(&self, device_code: &str) -> Result<DevicePoll>;

    /// Redeem a refresh token
    async fn refresh(&self, refresh_token: &Secret<String>) -> Result<TokenGrant>;

    /// Exchange an authorization code obtained through the broker's callback
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant>;

    /// Provider authorization endpoint the OAuth proxy redirects to
    fn authorize_endpoint(&self) -> String;
}

/// Source of the provider's published signing keys
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch_key_set(&self) -> Result<JwkSet>;
}

/// HTTP client for an OpenID Connect provider
#[derive(Debug, Clone)]
pub struct OidcProvider {
    identity: IdentityConfig,
    client: Client,
}

impl OidcProvider {
    pub fn new(identity: IdentityConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(identity.timeout())
            .user_agent(user_agent())
            .build()?;
        Ok(Self { identity, client })
    }

    fn unreachable(context: &str, e: reqwest::Error) -> BrokerError {
        if e.is_timeout() {
            warn!("{} timed out: {}", context, e);
            BrokerError::provider_unreachable(format!("{} timed out", context))
        } else {
            warn!("{} failed: {}", context, e);
            BrokerError::provider_unreachable(format!("{} failed: {}", context, e))
        }
    }

    async fn post_form(&self, context: &str, url: &str, form: &[(&str, &str)]) -> Result<Response> {
        self.client
            .post(url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| Self::unreachable(context, e))
    }

    async fn error_body(context: &str, response: Response) -> OAuthErrorBody {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        serde_json::from_str::<OAuthErrorBody>(&text).unwrap_or_else(|_| {
            error!("{} returned status {} with unparseable body", context, status);
            OAuthErrorBody {
                error: format!("http_{}", status.as_u16()),
                error_description: Some(text.chars().take(200).collect()),
            }
        })
    }

    async fn parse_grant(context: &str, response: Response) -> Result<TokenGrant> {
        response.json::<TokenGrant>().await.map_err(|e| {
            error!("Failed to parse {} response: {}", context, e);
            BrokerError::provider("invalid_response", format!("Invalid {} response", context))
        })
    }

    fn client_secret(&self) -> Result<&Secret<String>> {
        self.identity.client_secret.as_ref().ok_or_else(|| {
            BrokerError::config("identity.client_secret is required for authorization code exchange")
        })
    }
}

#[async_trait]
impl IdentityProvider for OidcProvider {
    async fn start_device_authorization(&self) -> Result<DeviceAuthorization> {
        let scope = self.identity.device_scopes();
        debug!(client_id = %self.identity.client_id, scope = %scope, "Starting device authorization");

        let response = self
            .post_form(
                "Device authorization",
                &self.identity.device_code_url(),
                &[("client_id", self.identity.client_id.as_str()), ("scope", scope.as_str())],
            )
            .await?;

        if !response.status().is_success() {
            let body = Self::error_body("Device authorization", response).await;
            return Err(BrokerError::provider(
                body.error,
                body.error_description.unwrap_or_default(),
            ));
        }

        let authorization: DeviceAuthorization = response.json().await.map_err(|e| {
            error!("Failed to parse device authorization response: {}", e);
            BrokerError::provider("invalid_response", "Invalid device authorization response")
        })?;

        info!(
            expires_in = authorization.expires_in,
            "Device authorization started"
        );
        Ok(authorization)
    }

    async fn poll_device_token(&self, device_code: &str) -> Result<DevicePoll> {
        let response = self
            .post_form(
                "Device token poll",
                &self.identity.token_url(),
                &[
                    ("grant_type", DEVICE_CODE_GRANT),
                    ("client_id", self.identity.client_id.as_str()),
                    ("device_code", device_code),
                ],
            )
            .await?;

        if response.status().is_success() {
            return Ok(DevicePoll::Granted(
                Self::parse_grant("device token", response).await?,
            ));
        }

        let body = Self::error_body("Device token poll", response).await;
        match body.error.as_str() {
            "authorization_pending" => Ok(DevicePoll::Pending),
            "slow_down" => Ok(DevicePoll::SlowDown),
            "access_denied" | "authorization_declined" => Ok(DevicePoll::Denied),
            "expired_token" | "code_expired" => Ok(DevicePoll::Expired),
            _ => Err(BrokerError::provider(
                body.error,
                body.error_description.unwrap_or_default(),
            )),
        }
    }

    async fn refresh(&self, refresh_token: &Secret<String>) -> Result<TokenGrant> {
        let scope = self.identity.device_scopes();
        let response = self
            .post_form(
                "Token refresh",
                &self.identity.token_url(),
                &[
                    ("grant_type", "refresh_token"),
                    ("client_id", self.identity.client_id.as_str()),
                    ("refresh_token", refresh_token.expose_secret().as_str()),
                    ("scope", scope.as_str()),
                ],
            )
            .await?;

        if response.status().is_success() {
            return Self::parse_grant("token refresh", response).await;
        }

        let status = response.status();
        let body = Self::error_body("Token refresh", response).await;
        if body.error == "invalid_grant" || status == StatusCode::UNAUTHORIZED {
            warn!("Refresh token rejected by provider: {}", body.error);
            return Err(BrokerError::no_cached_credential(
                "The cached refresh token is no longer valid",
            ));
        }
        Err(BrokerError::provider(
            body.error,
            body.error_description.unwrap_or_default(),
        ))
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant> {
        let secret = self.client_secret()?;
        let response = self
            .post_form(
                "Authorization code exchange",
                &self.identity.token_url(),
                &[
                    ("grant_type", "authorization_code"),
                    ("client_id", self.identity.client_id.as_str()),
                    ("client_secret", secret.expose_secret().as_str()),
                    ("code", code),
                    ("redirect_uri", redirect_uri),
                    ("scope", self.identity.api_scope.as_str()),
                ],
            )
            .await?;

        if response.status().is_success() {
            return Self::parse_grant("authorization code exchange", response).await;
        }

        let body = Self::error_body("Authorization code exchange", response).await;
        Err(BrokerError::provider(
            body.error,
            body.error_description.unwrap_or_default(),
        ))
    }

    fn authorize_endpoint(&self) -> String {
        self.identity.authorize_url()
    }
}

/// JWKS document with keys left unparsed so one unsupported key does not
/// discard the whole set
#[derive(Debug, Deserialize)]
struct RawJwks {
    keys: Vec<serde_json::Value>,
}

#[async_trait]
impl KeySource for OidcProvider {
    async fn fetch_key_set(&self) -> Result<JwkSet> {
        let url = self.identity.jwks_url();
        debug!(url = %url, "Fetching signing keys");

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Self::unreachable("JWKS fetch", e))?;

        if !response.status().is_success() {
            return Err(BrokerError::keys_unavailable(format!(
                "JWKS endpoint returned status {}",
                response.status()
            )));
        }

        let raw: RawJwks = response.json().await.map_err(|e| {
            BrokerError::keys_unavailable(format!("Invalid JWKS document: {}", e))
        })?;

        let keys: Vec<Jwk> = raw
            .keys
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<Jwk>(value) {
                Ok(jwk) => Some(jwk),
                Err(e) => {
                    debug!("Skipping unsupported JWKS entry: {}", e);
                    None
                }
            })
            .collect();

        Ok(JwkSet { keys })
    }
}
