//! Bearer token verification against the provider key ring

use crate::auth::key_ring::KeyRingCache;
use crate::auth::user_context::VerifiedIdentity;
use crate::config::Config;
use crate::error::{BrokerError, Result};
use chrono::{TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Claims read from a verified access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub upn: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub nbf: Option<i64>,
}

/// Pull the token out of an `Authorization` header value
pub fn extract_bearer(header_value: &str) -> Result<&str> {
    let (scheme, token) = header_value
        .trim()
        .split_once(' ')
        .ok_or_else(|| BrokerError::missing_token("Authorization header must use the Bearer scheme"))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(BrokerError::missing_token(
            "Authorization header must use the Bearer scheme",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(BrokerError::missing_token("Bearer token is empty"));
    }
    Ok(token)
}

fn is_asymmetric(alg: Algorithm) -> bool {
    !matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

fn map_jwt_error(error: &jsonwebtoken::errors::Error) -> BrokerError {
    match error.kind() {
        ErrorKind::ExpiredSignature => BrokerError::TokenExpired,
        ErrorKind::ImmatureSignature => BrokerError::TokenNotYetValid,
        ErrorKind::InvalidAudience => BrokerError::AudienceMismatch,
        ErrorKind::InvalidIssuer => BrokerError::IssuerMismatch,
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::InvalidKeyFormat
        | ErrorKind::InvalidRsaKey(_)
        | ErrorKind::InvalidEcdsaKey => BrokerError::signature_invalid(error.to_string()),
        ErrorKind::MissingRequiredClaim(claim) => {
            BrokerError::malformed_token(format!("Missing required claim '{}'", claim))
        }
        _ => BrokerError::malformed_token(error.to_string()),
    }
}

/// Verifies bearer tokens issued by the configured provider
pub struct BearerTokenValidator {
    key_ring: Arc<KeyRingCache>,
    issuer: String,
    audience: String,
    leeway_secs: u64,
}

impl BearerTokenValidator {
    pub fn new(
        key_ring: Arc<KeyRingCache>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        leeway_secs: u64,
    ) -> Self {
        Self {
            key_ring,
            issuer: issuer.into(),
            audience: audience.into(),
            leeway_secs,
        }
    }

    pub fn from_config(config: &Config, key_ring: Arc<KeyRingCache>) -> Self {
        Self::new(
            key_ring,
            config.identity.issuer(),
            config.identity.audience(),
            config.validation.clock_leeway_secs,
        )
    }

    pub fn key_ring(&self) -> &Arc<KeyRingCache> {
        &self.key_ring
    }

    /// Verify signature and claims. Never retried: a failure here is final
    /// for this token.
    pub async fn validate(&self, token: &str) -> Result<VerifiedIdentity> {
        let header = decode_header(token).map_err(|e| {
            debug!("Rejecting token with unreadable header: {}", e);
            BrokerError::malformed_token("Token is not a well-formed JWT")
        })?;

        if !is_asymmetric(header.alg) {
            warn!(alg = ?header.alg, "Rejecting token with symmetric algorithm");
            return Err(BrokerError::malformed_token(format!(
                "Unsupported token algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| BrokerError::malformed_token("Token header has no key id"))?;

        let keys = self.key_ring.get_keys().await?;
        let key = match keys.get(&kid) {
            Some(key) => key.clone(),
            None => {
                debug!(kid = %kid, "Unknown signing key, refreshing key set once");
                let refreshed = self.key_ring.force_refresh().await?;
                refreshed.get(&kid).cloned().ok_or_else(|| {
                    warn!(kid = %kid, "Token signed with a key the provider does not publish");
                    BrokerError::signature_invalid(format!("Unknown signing key '{}'", kid))
                })?
            }
        };

        let mut validation = Validation::new(key.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);
        // lifetime is checked below against the broker clock
        validation.validate_exp = false;
        validation.validate_nbf = false;

        let data = decode::<TokenClaims>(token, &key.key, &validation).map_err(|e| {
            let mapped = map_jwt_error(&e);
            warn!(kind = mapped.kind(), "Bearer token rejected: {}", e);
            mapped
        })?;

        let claims = data.claims;
        self.check_lifetime(&claims)?;
        let object_id = claims
            .oid
            .clone()
            .or_else(|| claims.sub.clone())
            .ok_or_else(|| BrokerError::malformed_token("Token has neither 'oid' nor 'sub'"))?;
        let subject = claims.sub.clone().unwrap_or_else(|| object_id.clone());
        let email = claims
            .preferred_username
            .or(claims.email)
            .or(claims.upn);
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| BrokerError::malformed_token("Invalid 'exp' claim"))?;

        Ok(VerifiedIdentity::new(
            subject,
            object_id,
            email,
            claims.tid,
            claims.name,
            expires_at,
            Secret::new(token.to_string()),
        ))
    }

    fn check_lifetime(&self, claims: &TokenClaims) -> Result<()> {
        let now = self.key_ring.clock().now().timestamp();
        let leeway = self.leeway_secs as i64;
        if claims.exp < now - leeway {
            warn!(kind = "TokenExpired", "Bearer token rejected: expired");
            return Err(BrokerError::TokenExpired);
        }
        if let Some(nbf) = claims.nbf {
            if nbf > now + leeway {
                warn!(kind = "TokenNotYetValid", "Bearer token rejected: not yet valid");
                return Err(BrokerError::TokenNotYetValid);
            }
        }
        Ok(())
    }

    /// Verify the token carried by an `Authorization` header value
    pub async fn validate_header(&self, header_value: Option<&str>) -> Result<VerifiedIdentity> {
        let value = header_value
            .ok_or_else(|| BrokerError::missing_token("Missing Authorization header"))?;
        let token = extract_bearer(value)?;
        self.validate(token).await
    }
}
