//! OAuth proxy session table
//!
//! One [`ProxySession`] per caller `state`, moving
//! `Initiated -> Exchanging -> ProviderGranted -> Redeemed`. Each transition
//! runs while holding the session's map entry, so check-and-flip is atomic: a
//! callback claims its session at most once at a time and a proxy code is
//! redeemed at most once no matter how many requests race for it. Expiry is
//! checked on every read; sweeping only reclaims memory.

use crate::auth::clock::SharedClock;
use crate::auth::pkce;
use crate::auth::provider::TokenGrant;
use crate::config::OAuthProxyConfig;
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Accepted PKCE challenge method
pub const CHALLENGE_METHOD_S256: &str = "S256";

/// Parameters of a validated `/authorize` request
#[derive(Debug, Clone)]
pub struct AuthorizeParams {
    pub client_id: String,
    pub redirect_uri: String,
    pub state: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub scope: Option<String>,
}

/// Where a proxy session is in its lifecycle
#[derive(Debug)]
pub enum SessionState {
    /// Caller sent to the provider; waiting for the callback
    Initiated,
    /// A callback holds the session while its code exchange runs
    Exchanging { claim: String },
    /// Provider tokens held; proxy code issued to the caller
    ProviderGranted { proxy_code: String, tokens: TokenGrant },
    /// Tokens handed out; kept until expiry to detect code reuse
    Redeemed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Initiated => "initiated",
            SessionState::Exchanging { .. } => "exchanging",
            SessionState::ProviderGranted { .. } => "provider_granted",
            SessionState::Redeemed => "redeemed",
        }
    }
}

/// One in-flight authorization-code exchange
#[derive(Debug)]
pub struct ProxySession {
    pub state: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub scope: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SessionState,
}

impl ProxySession {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Proxy code handed back to the caller's redirect URI
#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub proxy_code: String,
    pub redirect_uri: String,
    pub state: String,
}

/// Token endpoint request after form decoding
#[derive(Debug, Clone)]
pub struct RedeemParams<'a> {
    pub code: &'a str,
    pub code_verifier: &'a str,
    pub redirect_uri: Option<&'a str>,
    pub client_id: Option<&'a str>,
}

fn holds_claim(status: &SessionState, claim: &str) -> bool {
    match status {
        SessionState::Exchanging { claim: held } => {
            pkce::constant_time_eq(held.as_bytes(), claim.as_bytes())
        }
        _ => false,
    }
}

/// Concurrent table of proxy sessions
pub struct OAuthSessionStore {
    sessions: DashMap<String, ProxySession>,
    /// proxy code -> session state
    codes: DashMap<String, String>,
    clock: SharedClock,
    session_ttl: Duration,
    code_ttl: Duration,
}

impl OAuthSessionStore {
    pub fn new(clock: SharedClock, session_ttl: Duration, code_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            codes: DashMap::new(),
            clock,
            session_ttl,
            code_ttl,
        }
    }

    pub fn from_config(config: &OAuthProxyConfig, clock: SharedClock) -> Self {
        Self::new(
            clock,
            Duration::seconds(config.session_ttl_secs as i64),
            Duration::seconds(config.code_ttl_secs as i64),
        )
    }

    /// Record a new session in `Initiated`. A live session with the same
    /// state is never overwritten.
    pub fn begin(&self, params: AuthorizeParams) -> Result<()> {
        if params.code_challenge_method != CHALLENGE_METHOD_S256 {
            return Err(BrokerError::invalid_request(format!(
                "Unsupported code_challenge_method '{}'; only S256 is accepted",
                params.code_challenge_method
            )));
        }
        self.sweep();

        let now = self.clock.now();
        let session = ProxySession {
            state: params.state.clone(),
            client_id: params.client_id,
            redirect_uri: params.redirect_uri,
            code_challenge: params.code_challenge,
            scope: params.scope,
            created_at: now,
            expires_at: now + self.session_ttl,
            status: SessionState::Initiated,
        };

        match self.sessions.entry(params.state) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_expired(now) {
                    warn!("Rejecting authorize request reusing a live state");
                    return Err(BrokerError::invalid_request("state is already in use"));
                }
                existing.insert(session);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session);
            }
        }
        debug!(sessions = self.sessions.len(), "Proxy session initiated");
        Ok(())
    }

    /// `Initiated -> Exchanging`. The returned claim must accompany
    /// [`complete`](Self::complete) or [`release`](Self::release); a second
    /// callback for the same state fails while the first one holds it.
    pub fn claim_callback(&self, state: &str) -> Result<String> {
        let now = self.clock.now();
        let mut session = self
            .sessions
            .get_mut(state)
            .ok_or_else(|| BrokerError::unknown_session("Unknown authorization state"))?;
        if session.is_expired(now) {
            return Err(BrokerError::unknown_session("Authorization session expired"));
        }
        match session.status {
            SessionState::Initiated => {}
            SessionState::Exchanging { .. } => {
                warn!("Rejecting callback for a session whose exchange is in progress");
                return Err(BrokerError::unknown_session(
                    "Authorization session is already being completed",
                ));
            }
            _ => {
                return Err(BrokerError::unknown_session(
                    "Authorization session already completed",
                ))
            }
        }

        let claim = pkce::generate_token();
        session.status = SessionState::Exchanging {
            claim: claim.clone(),
        };
        Ok(claim)
    }

    /// `Exchanging -> ProviderGranted` for the holder of `claim`. Anything
    /// else drops the tokens and fails.
    pub fn complete(&self, state: &str, claim: &str, tokens: TokenGrant) -> Result<IssuedCode> {
        let now = self.clock.now();
        let issued = {
            let mut session = self
                .sessions
                .get_mut(state)
                .ok_or_else(|| BrokerError::unknown_session("Unknown authorization state"))?;
            if session.is_expired(now) {
                return Err(BrokerError::unknown_session("Authorization session expired"));
            }
            if !holds_claim(&session.status, claim) {
                warn!(status = session.status.name(), "Discarding tokens for a session that moved on");
                return Err(BrokerError::unknown_session(
                    "Authorization session already completed",
                ));
            }

            let proxy_code = pkce::generate_token();
            session.status = SessionState::ProviderGranted {
                proxy_code: proxy_code.clone(),
                tokens,
            };
            session.expires_at = now + self.code_ttl;
            IssuedCode {
                proxy_code,
                redirect_uri: session.redirect_uri.clone(),
                state: session.state.clone(),
            }
        };

        self.codes
            .insert(issued.proxy_code.clone(), issued.state.clone());
        info!("Proxy code issued");
        Ok(issued)
    }

    /// `Exchanging -> Initiated` after a failed exchange, so the genuine
    /// callback can still arrive. Only the holder of `claim` can release;
    /// a session that moved on is left alone.
    pub fn release(&self, state: &str, claim: &str) {
        if let Some(mut session) = self.sessions.get_mut(state) {
            if holds_claim(&session.status, claim) {
                session.status = SessionState::Initiated;
                debug!("Proxy session released after a failed exchange");
            }
        }
    }

    /// `ProviderGranted -> Redeemed`, returning the provider tokens exactly
    /// once. Failed checks leave the session untouched.
    pub fn redeem(&self, params: RedeemParams<'_>) -> Result<TokenGrant> {
        let state = self
            .codes
            .get(params.code)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::unknown_session("Invalid or expired authorization code"))?;

        let now = self.clock.now();
        let mut session = self
            .sessions
            .get_mut(&state)
            .ok_or_else(|| BrokerError::unknown_session("Invalid or expired authorization code"))?;

        match session.status {
            SessionState::Redeemed => {
                warn!("Proxy code presented again after redemption");
                return Err(BrokerError::CodeAlreadyUsed);
            }
            SessionState::ProviderGranted { ref proxy_code, .. }
                if pkce::constant_time_eq(proxy_code.as_bytes(), params.code.as_bytes()) => {}
            _ => {
                return Err(BrokerError::unknown_session(
                    "Invalid or expired authorization code",
                ))
            }
        }
        if session.is_expired(now) {
            return Err(BrokerError::unknown_session("Authorization code expired"));
        }
        if let Some(client_id) = params.client_id {
            if client_id != session.client_id {
                return Err(BrokerError::invalid_client("client_id does not match the authorization request"));
            }
        }
        if let Some(redirect_uri) = params.redirect_uri {
            if redirect_uri != session.redirect_uri {
                return Err(BrokerError::invalid_grant(
                    "redirect_uri does not match the authorization request",
                ));
            }
        }
        if !pkce::verify_s256(params.code_verifier, &session.code_challenge) {
            warn!("PKCE verification failed for proxy code");
            return Err(BrokerError::PkceMismatch);
        }

        match std::mem::replace(&mut session.status, SessionState::Redeemed) {
            SessionState::ProviderGranted { tokens, .. } => {
                info!("Proxy code redeemed");
                Ok(tokens)
            }
            // unreachable: status was matched above while the entry lock is held
            other => {
                session.status = other;
                Err(BrokerError::unknown_session("Invalid or expired authorization code"))
            }
        }
    }

    /// Remove expired sessions and their codes. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(now));
        let removed = before.saturating_sub(self.sessions.len());

        if removed > 0 {
            let live: HashSet<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
            self.codes.retain(|_, state| live.contains(state));
            debug!(removed, "Swept expired proxy sessions");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Lifecycle stage of the session for `state`, if any
    pub fn status_of(&self, state: &str) -> Option<&'static str> {
        self.sessions.get(state).map(|s| s.status.name())
    }

    /// Periodic sweep for as long as the store is alive
    pub fn spawn_sweeper(self: &Arc<Self>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}
