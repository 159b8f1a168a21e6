//! Shared helpers for the integration tests
#![allow(dead_code)]

use credential_broker::Config;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use secrecy::Secret;
use serde_json::{json, Value};
use std::path::Path;

pub const SIGNING_KEY_1: &str = include_str!("../fixtures/signing_key_1.pem");
pub const SIGNING_KEY_2: &str = include_str!("../fixtures/signing_key_2.pem");
pub const JWKS_JSON: &str = include_str!("../fixtures/jwks.json");

pub const TENANT: &str = "tenant-1";
pub const CLIENT_ID: &str = "client-1";

/// Fixture JWKS document
pub fn jwks() -> Value {
    serde_json::from_str(JWKS_JSON).unwrap()
}

/// Configuration pointing every provider endpoint at `idp_uri`
pub fn create_test_config(idp_uri: &str, cache_dir: &Path) -> Config {
    let mut config = Config::default();
    config.identity.authority = idp_uri.to_string();
    config.identity.tenant_id = TENANT.to_string();
    config.identity.client_id = CLIENT_ID.to_string();
    config.identity.client_secret = Some(Secret::new("broker-secret".to_string()));
    config.identity.api_scope = "api://downstream/.default".to_string();
    config.identity.timeout_secs = 2;
    config.local.token_cache_path = Some(cache_dir.join("token_cache.json"));
    config
}

/// Issuer the broker expects for tokens from `idp_uri`
pub fn issuer_for(idp_uri: &str) -> String {
    format!("{}/{}/v2.0", idp_uri, TENANT)
}

/// Claims accepted by a broker configured with [`create_test_config`]
pub fn valid_claims(issuer: &str) -> Value {
    let now = chrono::Utc::now().timestamp();
    json!({
        "iss": issuer,
        "aud": CLIENT_ID,
        "sub": "subject-1",
        "oid": "object-1",
        "tid": TENANT,
        "preferred_username": "user@example.com",
        "iat": now,
        "nbf": now,
        "exp": now + 3600,
    })
}

/// RS256 token signed with the fixture key for `kid`
pub fn sign(kid: &str, claims: &Value) -> String {
    let pem = if kid == "test-key-2" { SIGNING_KEY_2 } else { SIGNING_KEY_1 };
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();
    encode(&header, claims, &key).unwrap()
}

/// Token endpoint success body
pub fn token_body(access: &str, refresh: Option<&str>) -> Value {
    let mut body = json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": 3600,
        "scope": "api://downstream/.default",
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = json!(refresh);
    }
    body
}
