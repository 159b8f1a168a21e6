//! Cache of the identity provider's signing keys
//!
//! Readers get an `Arc<KeySet>` snapshot; a refresh builds a new set and swaps
//! it in, never mutating a published one. Fetches are serialized by an async
//! mutex and tagged with a generation number so callers that queued behind an
//! in-flight fetch reuse its result. Forced refreshes are further limited to
//! one per cooldown window.

use crate::auth::clock::SharedClock;
use crate::auth::provider::KeySource;
use crate::config::ValidationConfig;
use crate::error::{BrokerError, Result};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One usable verification key
#[derive(Clone)]
pub struct VerificationKey {
    pub key: DecodingKey,
    pub algorithm: Algorithm,
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Immutable snapshot of the provider's signing keys
#[derive(Debug, Clone)]
pub struct KeySet {
    keys: HashMap<String, VerificationKey>,
    fetched_at: DateTime<Utc>,
}

impl KeySet {
    /// Keep the keys that can verify signatures: a key id, signing use and
    /// an asymmetric algorithm are required.
    pub fn from_jwks(jwks: &JwkSet, fetched_at: DateTime<Utc>) -> Self {
        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                debug!("Skipping JWK without key id");
                continue;
            };
            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                continue;
            }
            let algorithm = match jwk.common.key_algorithm {
                Some(ref declared) => signing_algorithm(declared),
                None => inferred_algorithm(&jwk.algorithm),
            };
            let Some(algorithm) = algorithm else {
                debug!(kid = %kid, "Skipping JWK with unsupported algorithm");
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, VerificationKey { key, algorithm });
                }
                Err(e) => warn!(kid = %kid, "Skipping unusable JWK: {}", e),
            }
        }
        Self { keys, fetched_at }
    }

    pub fn get(&self, kid: &str) -> Option<&VerificationKey> {
        self.keys.get(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_ids(&self) -> Vec<&str> {
        self.keys.keys().map(String::as_str).collect()
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

fn signing_algorithm(declared: &KeyAlgorithm) -> Option<Algorithm> {
    match declared {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        // symmetric and encryption algorithms never verify bearer tokens
        _ => None,
    }
}

fn inferred_algorithm(params: &AlgorithmParameters) -> Option<Algorithm> {
    match params {
        AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
        AlgorithmParameters::EllipticCurve(ec) => match ec.curve {
            EllipticCurve::P256 => Some(Algorithm::ES256),
            EllipticCurve::P384 => Some(Algorithm::ES384),
            _ => None,
        },
        AlgorithmParameters::OctetKeyPair(_) => Some(Algorithm::EdDSA),
        _ => None,
    }
}

/// TTL-bounded cache of the provider key set
pub struct KeyRingCache {
    source: Arc<dyn KeySource>,
    clock: SharedClock,
    ttl: Duration,
    max_stale: Duration,
    fetch_timeout: std::time::Duration,
    refresh_cooldown: Duration,
    current: ArcSwapOption<KeySet>,
    /// Serializes fetches; holds the time of the last forced refresh
    fetch_lock: Mutex<Option<DateTime<Utc>>>,
    generation: AtomicU64,
}

impl KeyRingCache {
    pub fn new(
        source: Arc<dyn KeySource>,
        clock: SharedClock,
        ttl: Duration,
        max_stale: Duration,
        fetch_timeout: std::time::Duration,
    ) -> Self {
        Self {
            source,
            clock,
            ttl,
            max_stale,
            fetch_timeout,
            refresh_cooldown: Duration::zero(),
            current: ArcSwapOption::empty(),
            fetch_lock: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Minimum time between two forced refreshes
    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.refresh_cooldown = cooldown;
        self
    }

    pub fn from_config(
        config: &ValidationConfig,
        fetch_timeout: std::time::Duration,
        source: Arc<dyn KeySource>,
        clock: SharedClock,
    ) -> Self {
        Self::new(
            source,
            clock,
            Duration::seconds(config.jwks_cache_ttl_secs as i64),
            Duration::seconds(config.jwks_max_stale_secs as i64),
            fetch_timeout,
        )
        .with_refresh_cooldown(Duration::seconds(config.jwks_refresh_cooldown_secs as i64))
    }

    /// Cached key set if still within its TTL, otherwise a fresh one
    pub async fn get_keys(&self) -> Result<Arc<KeySet>> {
        if let Some(set) = self.fresh_snapshot() {
            return Ok(set);
        }

        let _fetch = self.fetch_lock.lock().await;
        if let Some(set) = self.fresh_snapshot() {
            return Ok(set);
        }
        self.fetch_locked().await
    }

    /// Refetch regardless of TTL. Callers that waited on a fetch which
    /// completed meanwhile get that result instead of fetching again, and
    /// within the cooldown of the previous forced refresh the current set is
    /// returned as is.
    pub async fn force_refresh(&self) -> Result<Arc<KeySet>> {
        let observed = self.generation.load(Ordering::Acquire);
        let mut last_forced = self.fetch_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != observed {
            if let Some(set) = self.current.load_full() {
                debug!("Reusing key set fetched while waiting");
                return Ok(set);
            }
        }

        let now = self.clock.now();
        if let (Some(at), Some(set)) = (*last_forced, self.current.load_full()) {
            if now - at < self.refresh_cooldown {
                debug!("Forced refresh within cooldown, keeping current key set");
                return Ok(set);
            }
        }
        *last_forced = Some(now);
        self.fetch_locked().await
    }

    /// Time source shared with token validation
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Number of successful fetches so far
    pub fn refresh_count(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Current snapshot without any freshness check
    pub fn snapshot(&self) -> Option<Arc<KeySet>> {
        self.current.load_full()
    }

    fn fresh_snapshot(&self) -> Option<Arc<KeySet>> {
        self.current
            .load_full()
            .filter(|set| self.clock.now() - set.fetched_at < self.ttl)
    }

    /// Must be called with `fetch_lock` held
    async fn fetch_locked(&self) -> Result<Arc<KeySet>> {
        let fetched = match tokio::time::timeout(self.fetch_timeout, self.source.fetch_key_set()).await {
            Ok(Ok(jwks)) => {
                let set = KeySet::from_jwks(&jwks, self.clock.now());
                if set.is_empty() {
                    Err(BrokerError::keys_unavailable(
                        "Provider published no usable signing keys",
                    ))
                } else {
                    Ok(set)
                }
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BrokerError::provider_unreachable(format!(
                "JWKS fetch timed out after {}s",
                self.fetch_timeout.as_secs()
            ))),
        };

        match fetched {
            Ok(set) => {
                let set = Arc::new(set);
                self.current.store(Some(set.clone()));
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                info!(keys = set.len(), generation, "Signing key set refreshed");
                Ok(set)
            }
            Err(e) => self.stale_fallback(e),
        }
    }

    fn stale_fallback(&self, error: BrokerError) -> Result<Arc<KeySet>> {
        if let Some(set) = self.current.load_full() {
            let age = self.clock.now() - set.fetched_at;
            if age <= self.max_stale {
                warn!(
                    age_secs = age.num_seconds(),
                    "Key set refresh failed, serving stale keys: {}", error
                );
                return Ok(set);
            }
        }
        warn!("Key set unavailable: {}", error);
        Err(BrokerError::keys_unavailable(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::test_helpers::{full_jwks, jwks_with, FakeKeySource};

    fn cache(source: Arc<FakeKeySource>, clock: ManualClock) -> KeyRingCache {
        KeyRingCache::new(
            source,
            Arc::new(clock),
            Duration::hours(1),
            Duration::hours(24),
            std::time::Duration::from_secs(5),
        )
    }

    #[test]
    fn test_key_set_from_fixture() {
        let set = KeySet::from_jwks(&full_jwks(), Utc::now());
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("test-key-1").unwrap().algorithm, Algorithm::RS256);
        assert!(set.get("missing").is_none());
    }

    #[test]
    fn test_symmetric_keys_are_skipped() {
        let jwks: JwkSet = serde_json::from_str(
            r#"{"keys":[{"kty":"oct","kid":"hmac","alg":"HS256","k":"c2VjcmV0"}]}"#,
        )
        .unwrap();
        assert!(KeySet::from_jwks(&jwks, Utc::now()).is_empty());
    }

    #[tokio::test]
    async fn test_cached_within_ttl() {
        let source = Arc::new(FakeKeySource::new(full_jwks()));
        let clock = ManualClock::default();
        let ring = cache(source.clone(), clock.clone());

        ring.get_keys().await.unwrap();
        clock.advance(Duration::minutes(59));
        ring.get_keys().await.unwrap();
        assert_eq!(source.fetch_count(), 1);

        clock.advance(Duration::minutes(2));
        ring.get_keys().await.unwrap();
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_keys_served_when_provider_down() {
        let source = Arc::new(FakeKeySource::new(full_jwks()));
        let clock = ManualClock::default();
        let ring = cache(source.clone(), clock.clone());

        ring.get_keys().await.unwrap();
        source.set_failing(true);
        clock.advance(Duration::hours(2));
        let set = ring.get_keys().await.unwrap();
        assert_eq!(set.len(), 2);

        clock.advance(Duration::hours(23));
        let err = ring.get_keys().await.unwrap_err();
        assert!(matches!(err, BrokerError::KeysUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_without_cache() {
        let source = Arc::new(FakeKeySource::new(full_jwks()));
        source.set_failing(true);
        let ring = cache(source, ManualClock::default());
        let err = ring.get_keys().await.unwrap_err();
        assert!(matches!(err, BrokerError::KeysUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_force_refresh_picks_up_rotation() {
        let source = Arc::new(FakeKeySource::new(jwks_with(&["test-key-1"])));
        let ring = cache(source.clone(), ManualClock::default());

        let before = ring.get_keys().await.unwrap();
        assert!(before.get("test-key-2").is_none());

        source.set_keys(jwks_with(&["test-key-2"]));
        let after = ring.force_refresh().await.unwrap();
        assert!(after.get("test-key-2").is_some());
        assert!(after.get("test-key-1").is_none());
        // the earlier snapshot is unchanged
        assert!(before.get("test-key-1").is_some());
        assert_eq!(ring.refresh_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_force_refresh_coalesces() {
        let source = Arc::new(FakeKeySource::new(full_jwks()));
        source.set_delay(std::time::Duration::from_millis(50));
        let ring = Arc::new(cache(source.clone(), ManualClock::default()));
        ring.get_keys().await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ring = ring.clone();
                tokio::spawn(async move { ring.force_refresh().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // one initial fetch, then far fewer than eight forced ones
        assert!(source.fetch_count() <= 3, "fetches: {}", source.fetch_count());
    }

    #[tokio::test]
    async fn test_forced_refresh_cooldown() {
        let source = Arc::new(FakeKeySource::new(full_jwks()));
        let clock = ManualClock::default();
        let ring = cache(source.clone(), clock.clone()).with_refresh_cooldown(Duration::seconds(30));
        ring.get_keys().await.unwrap();

        ring.force_refresh().await.unwrap();
        assert_eq!(source.fetch_count(), 2);
        for _ in 0..5 {
            ring.force_refresh().await.unwrap();
        }
        assert_eq!(source.fetch_count(), 2);

        clock.advance(Duration::seconds(31));
        ring.force_refresh().await.unwrap();
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_maps_to_unavailable() {
        let source = Arc::new(FakeKeySource::new(full_jwks()));
        source.set_delay(std::time::Duration::from_secs(30));
        let ring = cache(source, ManualClock::default());
        let err = ring.get_keys().await.unwrap_err();
        assert!(matches!(err, BrokerError::KeysUnavailable { .. }));
        assert!(err.to_string().contains("timed out"));
    }
}
