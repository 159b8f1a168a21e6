//! OAuth authorization-code proxy endpoints
//!
//! The broker sits between a public client and the identity provider:
//!
//! 1. `GET /authorize` records the caller's PKCE challenge under its `state`
//!    and redirects to the provider with the broker's own callback URL.
//! 2. `GET /callback` exchanges the provider code using the broker's
//!    confidential client and hands the caller a single-use proxy code.
//! 3. `POST /token` redeems the proxy code against the PKCE verifier.
//!
//! Session bookkeeping lives in [`OAuthSessionStore`].

use crate::auth::clock::SharedClock;
use crate::auth::oauth_session::{AuthorizeParams, OAuthSessionStore, RedeemParams};
use crate::auth::provider::{IdentityProvider, TokenGrant};
use crate::config::Config;
use crate::error::{BrokerError, Result};
use actix_web::{http::header, web, HttpRequest, HttpResponse};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

pub const AUTHORIZE_PATH: &str = "/authorize";
pub const CALLBACK_PATH: &str = "/callback";
pub const TOKEN_PATH: &str = "/token";
pub const METADATA_PATH: &str = "/.well-known/oauth-authorization-server";

/// Successful `/token` response body
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl From<TokenGrant> for TokenResponse {
    fn from(grant: TokenGrant) -> Self {
        Self {
            access_token: grant.access_token.expose_secret().clone(),
            token_type: grant.token_type,
            expires_in: grant.expires_in,
            refresh_token: grant.refresh_token.map(|t| t.expose_secret().clone()),
            scope: grant.scope,
        }
    }
}

/// OAuth proxy state shared by the route handlers
pub struct OAuthProxy {
    sessions: Arc<OAuthSessionStore>,
    provider: Arc<dyn IdentityProvider>,
    client_id: String,
    scope: String,
    public_base_url: Option<String>,
}

impl OAuthProxy {
    pub fn new(
        sessions: Arc<OAuthSessionStore>,
        provider: Arc<dyn IdentityProvider>,
        client_id: impl Into<String>,
        scope: impl Into<String>,
        public_base_url: Option<String>,
    ) -> Self {
        Self {
            sessions,
            provider,
            client_id: client_id.into(),
            scope: scope.into(),
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    pub fn from_config(
        config: &Config,
        provider: Arc<dyn IdentityProvider>,
        clock: SharedClock,
    ) -> Self {
        let sessions = Arc::new(OAuthSessionStore::from_config(&config.oauth_proxy, clock));
        Self::new(
            sessions,
            provider,
            config.identity.client_id.clone(),
            config.identity.api_scope.clone(),
            config.server.public_base_url.clone(),
        )
    }

    pub fn sessions(&self) -> &Arc<OAuthSessionStore> {
        &self.sessions
    }

    /// Externally visible base URL: configured, or derived from the request
    fn base_url(&self, req: &HttpRequest) -> String {
        match self.public_base_url {
            Some(ref base) => base.clone(),
            None => {
                let info = req.connection_info();
                format!("{}://{}", info.scheme(), info.host())
            }
        }
    }

    fn callback_url(&self, req: &HttpRequest) -> String {
        format!("{}{}", self.base_url(req), CALLBACK_PATH)
    }

    /// Validate an authorize request, start its session and build the
    /// provider redirect
    pub fn authorize(&self, query: &HashMap<String, String>, callback_url: &str) -> Result<String> {
        let client_id = required(query, "client_id")?;
        let redirect_uri = required(query, "redirect_uri")?;
        let state = required(query, "state")?;
        let code_challenge = required(query, "code_challenge")?;
        let code_challenge_method = query
            .get("code_challenge_method")
            .cloned()
            .unwrap_or_else(|| "plain".to_string());

        if client_id != self.client_id {
            warn!("Authorize request for unknown client_id");
            return Err(BrokerError::invalid_client("Unknown client_id"));
        }
        Url::parse(&redirect_uri)
            .map_err(|_| BrokerError::invalid_request("redirect_uri must be an absolute URL"))?;

        self.sessions.begin(AuthorizeParams {
            client_id,
            redirect_uri,
            state: state.clone(),
            code_challenge,
            code_challenge_method,
            scope: query.get("scope").cloned(),
        })?;

        let mut location = Url::parse(&self.provider.authorize_endpoint()).map_err(|e| {
            BrokerError::config(format!("Invalid provider authorize endpoint: {}", e))
        })?;
        location
            .query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", callback_url)
            .append_pair("response_mode", "query")
            .append_pair("scope", &self.scope)
            .append_pair("state", &state);
        Ok(location.into())
    }

    /// Exchange the provider code and build the redirect carrying the proxy code.
    ///
    /// `state` alone does not authenticate a callback, so nothing here removes
    /// a session: an error callback leaves it to expire and a failed exchange
    /// hands it back for the genuine callback.
    pub async fn callback(&self, query: &HashMap<String, String>, callback_url: &str) -> Result<String> {
        if let Some(provider_error) = query.get("error") {
            let description = query
                .get("error_description")
                .cloned()
                .unwrap_or_else(|| provider_error.clone());
            warn!(error = %provider_error, "Identity provider returned an authorization error");
            return Err(BrokerError::provider(provider_error.clone(), description));
        }

        let code = required(query, "code")?;
        let state = required(query, "state")?;
        let claim = self.sessions.claim_callback(&state)?;

        // Detached so a dropped connection cannot stop between exchange and
        // the state transition.
        let provider = self.provider.clone();
        let sessions = self.sessions.clone();
        let callback_url = callback_url.to_string();
        let issued = tokio::spawn(async move {
            match provider.exchange_code(&code, &callback_url).await {
                Ok(grant) => sessions.complete(&state, &claim, grant),
                Err(e) => {
                    sessions.release(&state, &claim);
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| BrokerError::Internal(anyhow::anyhow!("Code exchange task failed: {}", e)))??;

        let mut location = Url::parse(&issued.redirect_uri)
            .map_err(|_| BrokerError::invalid_request("redirect_uri must be an absolute URL"))?;
        location
            .query_pairs_mut()
            .append_pair("code", &issued.proxy_code)
            .append_pair("state", &issued.state);
        Ok(location.into())
    }

    /// Redeem a proxy code
    pub fn token(&self, form: &HashMap<String, String>) -> Result<TokenResponse> {
        let grant_type = required(form, "grant_type")?;
        if grant_type != "authorization_code" {
            return Err(BrokerError::invalid_request(format!(
                "Unsupported grant_type '{}'",
                grant_type
            )));
        }
        let code = required(form, "code")?;
        let verifier = form.get("code_verifier").map(String::as_str).unwrap_or_default();

        let grant = self.sessions.redeem(RedeemParams {
            code: &code,
            code_verifier: verifier,
            redirect_uri: form.get("redirect_uri").map(String::as_str),
            client_id: form.get("client_id").map(String::as_str),
        })?;
        Ok(grant.into())
    }

    /// RFC 8414 authorization server metadata
    pub fn metadata(&self, base_url: &str) -> serde_json::Value {
        json!({
            "issuer": base_url,
            "authorization_endpoint": format!("{}{}", base_url, AUTHORIZE_PATH),
            "token_endpoint": format!("{}{}", base_url, TOKEN_PATH),
            "response_types_supported": ["code"],
            "grant_types_supported": ["authorization_code"],
            "code_challenge_methods_supported": ["S256"],
            "token_endpoint_auth_methods_supported": ["none"],
            "scopes_supported": [self.scope],
        })
    }
}

fn required(params: &HashMap<String, String>, name: &str) -> Result<String> {
    match params.get(name) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(BrokerError::invalid_request(format!(
            "Missing required parameter: {}",
            name
        ))),
    }
}

/// RFC 6749 style error body
pub fn oauth_error_response(error: &BrokerError) -> HttpResponse {
    let status = match error {
        BrokerError::Provider { .. } => actix_web::http::StatusCode::BAD_REQUEST,
        other => other.status_code(),
    };
    let code = match error {
        BrokerError::Provider { code, .. } => code.clone(),
        other => other.oauth_error_code().to_string(),
    };
    HttpResponse::build(status)
        .insert_header((header::CACHE_CONTROL, "no-store"))
        .json(json!({
            "error": code,
            "error_description": error.public_message(),
            "error_kind": error.kind(),
        }))
}

async fn authorize_handler(
    req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
    proxy: web::Data<OAuthProxy>,
) -> HttpResponse {
    let callback_url = proxy.callback_url(&req);
    match proxy.authorize(&query, &callback_url) {
        Ok(location) => {
            debug!("Redirecting authorize request to the identity provider");
            HttpResponse::Found()
                .insert_header((header::LOCATION, location))
                .finish()
        }
        Err(e) => {
            warn!(kind = e.kind(), "Authorize request rejected: {}", e);
            oauth_error_response(&e)
        }
    }
}

async fn callback_handler(
    req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
    proxy: web::Data<OAuthProxy>,
) -> HttpResponse {
    let callback_url = proxy.callback_url(&req);
    match proxy.callback(&query, &callback_url).await {
        Ok(location) => HttpResponse::Found()
            .insert_header((header::LOCATION, location))
            .finish(),
        Err(e) => {
            if matches!(e, BrokerError::Internal(_)) {
                error!("OAuth callback failed: {}", e);
            } else {
                warn!(kind = e.kind(), "OAuth callback rejected: {}", e);
            }
            oauth_error_response(&e)
        }
    }
}

async fn token_handler(
    form: web::Form<HashMap<String, String>>,
    proxy: web::Data<OAuthProxy>,
) -> HttpResponse {
    match proxy.token(&form) {
        Ok(response) => {
            info!("Issued provider tokens for a redeemed proxy code");
            HttpResponse::Ok()
                .insert_header((header::CACHE_CONTROL, "no-store"))
                .json(response)
        }
        Err(e) => {
            warn!(kind = e.kind(), "Token request rejected");
            oauth_error_response(&e)
        }
    }
}

async fn metadata_handler(req: HttpRequest, proxy: web::Data<OAuthProxy>) -> HttpResponse {
    HttpResponse::Ok().json(proxy.metadata(&proxy.base_url(&req)))
}

/// Register the proxy endpoints
pub fn configure_oauth_routes(cfg: &mut web::ServiceConfig, proxy: web::Data<OAuthProxy>) {
    cfg.app_data(proxy)
        .route(AUTHORIZE_PATH, web::get().to(authorize_handler))
        .route(CALLBACK_PATH, web::get().to(callback_handler))
        .route(TOKEN_PATH, web::post().to(token_handler))
        .route(METADATA_PATH, web::get().to(metadata_handler));
}
