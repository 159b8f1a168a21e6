//! Fakes and token helpers shared by the auth unit tests

use crate::auth::provider::{DeviceAuthorization, DevicePoll, IdentityProvider, KeySource, TokenGrant};
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use secrecy::{ExposeSecret, Secret};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const SIGNING_KEY_1: &str = include_str!("../../tests/fixtures/signing_key_1.pem");
pub const SIGNING_KEY_2: &str = include_str!("../../tests/fixtures/signing_key_2.pem");
pub const JWKS_JSON: &str = include_str!("../../tests/fixtures/jwks.json");

pub const TENANT: &str = "tenant-1";
pub const CLIENT_ID: &str = "client-1";
pub const ISSUER: &str = "https://login.microsoftonline.com/tenant-1/v2.0";

pub fn grant(access: &str, refresh: Option<&str>, expires_in: u64) -> TokenGrant {
    TokenGrant {
        access_token: Secret::new(access.to_string()),
        token_type: "Bearer".to_string(),
        expires_in: Some(expires_in),
        refresh_token: refresh.map(|r| Secret::new(r.to_string())),
        scope: Some("api://client-1/.default".to_string()),
    }
}

/// Both fixture keys
pub fn full_jwks() -> JwkSet {
    serde_json::from_str(JWKS_JSON).expect("fixture JWKS parses")
}

/// Fixture JWKS restricted to the given key ids
pub fn jwks_with(kids: &[&str]) -> JwkSet {
    let mut set = full_jwks();
    set.keys
        .retain(|k| k.common.key_id.as_deref().map_or(false, |kid| kids.contains(&kid)));
    set
}

/// Claims accepted by a validator configured with [`ISSUER`] and [`CLIENT_ID`]
pub fn valid_claims() -> serde_json::Value {
    let now = chrono::Utc::now().timestamp();
    serde_json::json!({
        "iss": ISSUER,
        "aud": CLIENT_ID,
        "sub": "subject-1",
        "oid": "object-1",
        "tid": TENANT,
        "preferred_username": "user@example.com",
        "iat": now,
        "nbf": now - 10,
        "exp": now + 3600,
    })
}

/// RS256-sign claims with the fixture key matching `kid`
pub fn sign(kid: &str, claims: &serde_json::Value) -> String {
    let pem = if kid == "test-key-2" { SIGNING_KEY_2 } else { SIGNING_KEY_1 };
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(pem.as_bytes()).expect("fixture key parses");
    encode(&header, claims, &key).expect("token encodes")
}

/// Scriptable identity provider
pub struct FakeProvider {
    polls: Mutex<VecDeque<Result<DevicePoll>>>,
    poll_count: AtomicUsize,
    refresh_count: AtomicUsize,
    refresh_delay: Mutex<Duration>,
    refresh_fails: AtomicBool,
    refresh_outages: AtomicUsize,
    exchange_count: AtomicUsize,
    exchange_delay: Mutex<Duration>,
    exchange_fails: AtomicBool,
    rejected_codes: Mutex<Vec<String>>,
    last_redirect_uri: Mutex<Option<String>>,
    seen_refresh_tokens: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            polls: Mutex::new(VecDeque::new()),
            poll_count: AtomicUsize::new(0),
            refresh_count: AtomicUsize::new(0),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_fails: AtomicBool::new(false),
            refresh_outages: AtomicUsize::new(0),
            exchange_count: AtomicUsize::new(0),
            exchange_delay: Mutex::new(Duration::ZERO),
            exchange_fails: AtomicBool::new(false),
            rejected_codes: Mutex::new(Vec::new()),
            last_redirect_uri: Mutex::new(None),
            seen_refresh_tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn script_polls(&self, polls: Vec<DevicePoll>) {
        self.polls.lock().unwrap().extend(polls.into_iter().map(Ok));
    }

    /// Next poll fails as if the provider were unreachable
    pub fn script_poll_outage(&self) {
        self.polls
            .lock()
            .unwrap()
            .push_back(Err(BrokerError::provider_unreachable("connection reset")));
    }

    pub fn poll_count(&self) -> usize {
        self.poll_count.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_count.load(Ordering::SeqCst)
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn fail_refresh(&self) {
        self.refresh_fails.store(true, Ordering::SeqCst);
    }

    /// The next `times` refresh calls fail as unreachable
    pub fn refresh_outages(&self, times: usize) {
        self.refresh_outages.store(times, Ordering::SeqCst);
    }

    pub fn seen_refresh_tokens(&self) -> Vec<String> {
        self.seen_refresh_tokens.lock().unwrap().clone()
    }

    pub fn exchange_count(&self) -> usize {
        self.exchange_count.load(Ordering::SeqCst)
    }

    pub fn set_exchange_delay(&self, delay: Duration) {
        *self.exchange_delay.lock().unwrap() = delay;
    }

    pub fn fail_exchange(&self) {
        self.exchange_fails.store(true, Ordering::SeqCst);
    }

    /// Exchanges of `code` fail; other codes still succeed
    pub fn reject_code(&self, code: &str) {
        self.rejected_codes.lock().unwrap().push(code.to_string());
    }

    pub fn last_redirect_uri(&self) -> Option<String> {
        self.last_redirect_uri.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn start_device_authorization(&self) -> Result<DeviceAuthorization> {
        Ok(DeviceAuthorization {
            device_code: "device-code".to_string(),
            user_code: "USER-CODE".to_string(),
            verification_uri: "https://idp.example.com/device".to_string(),
            verification_uri_complete: None,
            expires_in: 10,
            interval: Some(1),
            message: None,
        })
    }

    async fn poll_device_token(&self, _device_code: &str) -> Result<DevicePoll> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(DevicePoll::Pending))
    }

    async fn refresh(&self, refresh_token: &Secret<String>) -> Result<TokenGrant> {
        let n = self.refresh_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen_refresh_tokens
            .lock()
            .unwrap()
            .push(refresh_token.expose_secret().clone());
        let delay = *self.refresh_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outage = self
            .refresh_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if outage {
            return Err(BrokerError::provider_unreachable("connection refused"));
        }
        if self.refresh_fails.load(Ordering::SeqCst) {
            return Err(BrokerError::no_cached_credential("refresh token revoked"));
        }
        Ok(grant(
            &format!("refreshed-{}", n),
            Some(&format!("refresh-{}", n)),
            3600,
        ))
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant> {
        self.exchange_count.fetch_add(1, Ordering::SeqCst);
        *self.last_redirect_uri.lock().unwrap() = Some(redirect_uri.to_string());
        let delay = *self.exchange_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let rejected = self.rejected_codes.lock().unwrap().iter().any(|c| c == code);
        if rejected || self.exchange_fails.load(Ordering::SeqCst) {
            return Err(BrokerError::provider("invalid_grant", "code was already redeemed"));
        }
        Ok(grant(
            &format!("provider-access-{}", code),
            Some("provider-refresh"),
            3600,
        ))
    }

    fn authorize_endpoint(&self) -> String {
        "https://idp.example.com/authorize".to_string()
    }
}

/// Key source serving a replaceable JWKS
pub struct FakeKeySource {
    keys: Mutex<JwkSet>,
    fetch_count: AtomicUsize,
    fails: AtomicBool,
    delay: Mutex<Duration>,
}

impl FakeKeySource {
    pub fn new(keys: JwkSet) -> Self {
        Self {
            keys: Mutex::new(keys),
            fetch_count: AtomicUsize::new(0),
            fails: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_keys(&self, keys: JwkSet) {
        *self.keys.lock().unwrap() = keys;
    }

    pub fn set_failing(&self, fails: bool) {
        self.fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for FakeKeySource {
    async fn fetch_key_set(&self) -> Result<JwkSet> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fails.load(Ordering::SeqCst) {
            return Err(BrokerError::provider_unreachable("JWKS fetch failed"));
        }
        Ok(self.keys.lock().unwrap().clone())
    }
}
