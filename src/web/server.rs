//! HTTP surface of the broker
//!
//! `GET /` is the unauthenticated liveness check. In remote mode every other
//! path sits behind [`BearerAuthMiddleware`] (the OAuth proxy endpoints are on
//! its bypass list) and `/api/{tail}` forwards to the downstream API with the
//! caller's own token. In local mode `/api/{tail}` uses the cached local
//! credential instead.

use crate::auth::clock::SharedClock;
use crate::auth::jwt::BearerTokenValidator;
use crate::auth::key_ring::KeyRingCache;
use crate::auth::local_credentials::LocalCredentialManager;
use crate::auth::middleware::{verified_identity, BearerAuthMiddleware};
use crate::auth::oauth::{configure_oauth_routes, OAuthProxy};
use crate::auth::outbound::{DownstreamClient, OutboundCredentials, OutboundRequest};
use crate::auth::provider::{IdentityProvider, KeySource};
use crate::auth::transport::{select_strategy, TransportMode};
use crate::config::Config;
use crate::error::{BrokerError, Result};
use actix_web::{
    http::{header, Method, StatusCode},
    middleware::{Condition, DefaultHeaders, Logger},
    web, App, HttpRequest, HttpResponse, HttpServer,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared per-process state visible to handlers
pub struct AppState {
    pub transport: TransportMode,
    pub downstream: Option<DownstreamClient>,
}

/// Assembled broker components for one transport mode
pub struct BrokerServer {
    config: Config,
    state: web::Data<AppState>,
    validator: Option<Arc<BearerTokenValidator>>,
    oauth: Option<web::Data<OAuthProxy>>,
}

impl BrokerServer {
    /// Wire up the components the configured transport mode needs
    pub fn build(
        config: Config,
        provider: Arc<dyn IdentityProvider>,
        keys: Arc<dyn KeySource>,
        clock: SharedClock,
    ) -> Result<Self> {
        let transport = select_strategy(&config)?;

        let (validator, oauth, credentials) = match transport {
            TransportMode::Remote => {
                let key_ring = Arc::new(KeyRingCache::from_config(
                    &config.validation,
                    config.identity.timeout(),
                    keys,
                    clock.clone(),
                ));
                let validator = Arc::new(BearerTokenValidator::from_config(&config, key_ring));
                let oauth = if config.oauth_proxy.enabled {
                    Some(web::Data::new(OAuthProxy::from_config(&config, provider, clock)))
                } else {
                    None
                };
                (Some(validator), oauth, OutboundCredentials::Remote)
            }
            TransportMode::Local => {
                let manager = LocalCredentialManager::from_config(&config.local, provider, clock)?;
                (None, None, OutboundCredentials::Local(manager))
            }
        };

        let downstream = match config.downstream.api_base_url {
            Some(ref base_url) => Some(DownstreamClient::new(
                base_url,
                credentials,
                config.identity.timeout(),
            )?),
            None => None,
        };

        info!(
            transport = %transport,
            oauth_proxy = oauth.is_some(),
            downstream = downstream.is_some(),
            "Broker components ready"
        );

        Ok(Self {
            config,
            state: web::Data::new(AppState {
                transport,
                downstream,
            }),
            validator,
            oauth,
        })
    }

    pub fn transport(&self) -> TransportMode {
        self.state.transport
    }

    pub fn oauth_proxy(&self) -> Option<&web::Data<OAuthProxy>> {
        self.oauth.as_ref()
    }

    /// Cross-origin headers, sent only in remote mode. Local mode serves the
    /// user's own credential and must not be readable from other origins.
    pub fn cors(&self) -> Condition<DefaultHeaders> {
        Condition::new(self.transport() == TransportMode::Remote, cors_headers())
    }

    /// Register all routes, behind bearer authentication in remote mode
    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        match self.validator {
            Some(ref validator) => {
                cfg.service(
                    web::scope("")
                        .wrap(BearerAuthMiddleware::new(validator.clone()))
                        .configure(|scope| self.routes(scope)),
                );
            }
            None => self.routes(cfg),
        }
    }

    fn routes(&self, cfg: &mut web::ServiceConfig) {
        cfg.app_data(self.state.clone())
            .route("/", web::get().to(health_check));

        if let Some(ref oauth) = self.oauth {
            configure_oauth_routes(cfg, oauth.clone());
        }

        cfg.service(
            web::resource("/api/{tail:.*}")
                .route(web::method(Method::OPTIONS).to(preflight))
                .route(web::route().to(api_passthrough)),
        );
    }

    /// Bind and serve until shutdown
    pub async fn run(self) -> Result<()> {
        let bind_address = format!("{}:{}", self.config.server.host, self.config.server.port);

        let _sweeper = self.oauth.as_ref().map(|oauth| {
            oauth
                .sessions()
                .spawn_sweeper(Duration::from_secs(self.config.oauth_proxy.sweep_interval_secs))
        });

        info!(
            address = %bind_address,
            transport = %self.transport(),
            "Starting credential broker HTTP server"
        );

        let server = Arc::new(self);
        HttpServer::new(move || {
            let server = server.clone();
            App::new()
                .wrap(server.cors())
                .wrap(Logger::default())
                .configure(move |cfg| server.configure(cfg))
        })
        .bind(&bind_address)?
        .run()
        .await?;

        debug!("HTTP server stopped");
        Ok(())
    }
}

/// Permissive CORS response headers
pub fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, PUT, PATCH, DELETE, OPTIONS"))
        .add((header::ACCESS_CONTROL_ALLOW_HEADERS, "Authorization, Content-Type"))
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "version": crate::VERSION,
        "transport": state.transport.as_str(),
    }))
}

async fn preflight() -> HttpResponse {
    HttpResponse::NoContent().finish()
}

/// Forward `/api/{tail}` to the downstream API
async fn api_passthrough(
    req: HttpRequest,
    tail: web::Path<String>,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> std::result::Result<HttpResponse, BrokerError> {
    let downstream = match state.downstream {
        Some(ref downstream) => downstream,
        None => {
            warn!("API request received but no downstream API is configured");
            return Ok(HttpResponse::ServiceUnavailable().json(json!({
                "error": "DownstreamNotConfigured",
                "message": "No downstream API is configured.",
            })));
        }
    };

    let mut path = tail.into_inner();
    if !req.query_string().is_empty() {
        path = format!("{}?{}", path, req.query_string());
    }
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|_| BrokerError::invalid_request("Unsupported HTTP method"))?;
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let identity = verified_identity(&req);
    let response = downstream
        .send(
            OutboundRequest {
                method,
                path,
                content_type,
                body: (!body.is_empty()).then(|| body.to_vec()),
            },
            identity.as_ref(),
        )
        .await?;

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    if let Some(content_type) = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        builder.insert_header((header::CONTENT_TYPE, content_type.to_string()));
    }
    let payload = response.bytes().await?;
    Ok(builder.body(payload))
}
