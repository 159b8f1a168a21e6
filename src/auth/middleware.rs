//! Bearer authentication middleware for the network transport
//!
//! Every request outside the bypass list must carry `Authorization: Bearer`.
//! A verified [`VerifiedIdentity`] is placed in the request extensions for
//! handlers and the outbound client; anything else ends in a `401` whose JSON
//! body names the rejection kind.

use crate::auth::jwt::BearerTokenValidator;
use crate::auth::user_context::VerifiedIdentity;
use crate::error::BrokerError;
use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http::{header, Method},
    Error as ActixError, HttpMessage, HttpRequest, HttpResponse,
};
use futures_util::future::{ok, LocalBoxFuture, Ready};
use std::{rc::Rc, sync::Arc};
use tracing::{debug, warn};

/// Paths that authenticate by other means or must stay reachable
pub fn default_bypass_paths() -> Vec<String> {
    [
        "/",
        "/authorize",
        "/callback",
        "/token",
        "/.well-known/oauth-authorization-server",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

/// Bearer token authentication middleware
#[derive(Clone)]
pub struct BearerAuthMiddleware {
    validator: Arc<BearerTokenValidator>,
    bypass_paths: Arc<Vec<String>>,
}

impl BearerAuthMiddleware {
    pub fn new(validator: Arc<BearerTokenValidator>) -> Self {
        Self {
            validator,
            bypass_paths: Arc::new(default_bypass_paths()),
        }
    }

    pub fn with_bypass_paths(mut self, paths: Vec<String>) -> Self {
        self.bypass_paths = Arc::new(paths);
        self
    }

    fn is_bypassed(bypass_paths: &[String], req: &ServiceRequest) -> bool {
        req.method() == Method::OPTIONS || bypass_paths.iter().any(|p| p == req.path())
    }

    /// 401 response for a rejected credential. The body never echoes the token.
    pub fn create_auth_error_response(error: &BrokerError) -> HttpResponse {
        let challenge = match error {
            BrokerError::MissingToken { .. } => "Bearer".to_string(),
            other => format!(
                "Bearer error=\"invalid_token\", error_description=\"{}\"",
                other.public_message().replace('"', "'")
            ),
        };
        HttpResponse::Unauthorized()
            .insert_header((header::WWW_AUTHENTICATE, challenge))
            .json(serde_json::json!({
                "error": error.kind(),
                "message": error.public_message(),
            }))
    }
}

impl<S> Transform<S, ServiceRequest> for BearerAuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse, Error = ActixError> + 'static,
    S::Future: 'static,
{
    type Response = ServiceResponse;
    type Error = ActixError;
    type InitError = ();
    type Transform = BearerAuthMiddlewareService<S>;
    type Future = Ready<std::result::Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(BearerAuthMiddlewareService {
            service: Rc::new(service),
            validator: self.validator.clone(),
            bypass_paths: self.bypass_paths.clone(),
        })
    }
}

pub struct BearerAuthMiddlewareService<S> {
    service: Rc<S>,
    validator: Arc<BearerTokenValidator>,
    bypass_paths: Arc<Vec<String>>,
}

impl<S> Service<ServiceRequest> for BearerAuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse, Error = ActixError> + 'static,
    S::Future: 'static,
{
    type Response = ServiceResponse;
    type Error = ActixError;
    type Future = LocalBoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let validator = self.validator.clone();
        let bypass_paths = self.bypass_paths.clone();

        Box::pin(async move {
            if BearerAuthMiddleware::is_bypassed(&bypass_paths, &req) {
                return service.call(req).await;
            }

            let header_value = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            match validator.validate_header(header_value.as_deref()).await {
                Ok(identity) => {
                    debug!(
                        user = %identity.display_name(),
                        tenant = identity.tenant_id.as_deref().unwrap_or("-"),
                        token = %identity.token_fingerprint(),
                        path = %req.path(),
                        "Bearer token accepted"
                    );
                    req.extensions_mut().insert(identity);
                    service.call(req).await
                }
                Err(e) => {
                    warn!(
                        kind = e.kind(),
                        path = %req.path(),
                        "Rejecting unauthenticated request"
                    );
                    let response = BearerAuthMiddleware::create_auth_error_response(&e);
                    Ok(req.into_response(response))
                }
            }
        })
    }
}

/// Identity placed in the request by [`BearerAuthMiddleware`]
pub fn verified_identity(req: &HttpRequest) -> Option<VerifiedIdentity> {
    req.extensions().get::<VerifiedIdentity>().cloned()
}
