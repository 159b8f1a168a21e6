//! Local-mode credential manager
//!
//! Owns the device-code login and keeps the cached credential fresh. Refresh is
//! single-flight: the store lock is held across check, refresh and persist, so
//! concurrent callers that find an expiring token queue behind one refresh and
//! then observe its result.

use crate::auth::clock::SharedClock;
use crate::auth::credential_store::{fingerprint, CachedToken, CredentialStore};
use crate::auth::device_code::{DeviceCodeFlow, DevicePrompt};
use crate::auth::provider::{IdentityProvider, TokenGrant};
use crate::config::LocalCredentialConfig;
use crate::error::{BrokerError, Result};
use chrono::Duration;
use secrecy::{ExposeSecret, Secret};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pause before the single retry of an unreachable provider
const REFRESH_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

fn no_cached_token() -> BrokerError {
    BrokerError::no_cached_credential(format!(
        "No cached authentication token found. Please run '{} login' to authenticate.",
        env!("CARGO_PKG_NAME")
    ))
}

/// Device-code login plus cached, auto-refreshed access tokens
#[derive(Clone)]
pub struct LocalCredentialManager {
    store: Arc<CredentialStore>,
    provider: Arc<dyn IdentityProvider>,
    clock: SharedClock,
    refresh_margin: Duration,
}

impl LocalCredentialManager {
    pub fn new(
        store: Arc<CredentialStore>,
        provider: Arc<dyn IdentityProvider>,
        clock: SharedClock,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            clock,
            refresh_margin,
        }
    }

    pub fn from_config(
        config: &LocalCredentialConfig,
        provider: Arc<dyn IdentityProvider>,
        clock: SharedClock,
    ) -> Result<Self> {
        let store = Arc::new(CredentialStore::new(config.cache_path()?));
        Ok(Self::new(store, provider, clock, config.refresh_margin()))
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Run the device-code login and persist the resulting credential
    pub async fn acquire(&self, prompt: &dyn DevicePrompt) -> Result<CachedToken> {
        let grant = DeviceCodeFlow::new(self.provider.clone()).run(prompt).await?;
        let token = CachedToken::from_grant(&grant, self.clock.now());

        let mut guard = self.store.lock().await?;
        guard.put(token.clone()).await?;
        info!(
            fingerprint = %token.fingerprint(),
            path = %self.store.path().display(),
            "Login complete"
        );
        Ok(token)
    }

    /// Current access token, refreshed first when it is close to expiry
    pub async fn get_token(&self) -> Result<Secret<String>> {
        {
            let guard = self.store.lock().await?;
            match guard.token() {
                None => return Err(no_cached_token()),
                Some(token) if !token.needs_refresh(self.clock.now(), self.refresh_margin) => {
                    return Ok(token.access_token.clone());
                }
                Some(_) => {}
            }
        }
        self.spawn_refresh(None).await
    }

    /// Refresh after the downstream API rejected `rejected`. Returns the
    /// replacement without a provider call when another caller already
    /// refreshed.
    pub async fn force_refresh(&self, rejected: &Secret<String>) -> Result<Secret<String>> {
        self.spawn_refresh(Some(rejected.clone())).await
    }

    /// Delete the cached credential. Returns whether one existed.
    pub async fn logout(&self) -> Result<bool> {
        let mut guard = self.store.lock().await?;
        let existed = guard.token().is_some();
        guard.clear().await?;
        Ok(existed)
    }

    /// Snapshot of the cached record, for status reporting
    pub async fn cached(&self) -> Result<Option<CachedToken>> {
        self.store.get().await
    }

    /// Runs the refresh on its own task so a caller dropping its future
    /// cannot interrupt the refresh between the provider call and persist.
    async fn spawn_refresh(&self, rejected: Option<Secret<String>>) -> Result<Secret<String>> {
        let this = self.clone();
        tokio::spawn(async move { this.refresh_locked(rejected).await })
            .await
            .map_err(|e| {
                BrokerError::Internal(anyhow::anyhow!("Credential refresh task failed: {}", e))
            })?
    }

    async fn refresh_locked(&self, rejected: Option<Secret<String>>) -> Result<Secret<String>> {
        let mut guard = self.store.lock().await?;
        let now = self.clock.now();
        let current = guard.token().cloned().ok_or_else(no_cached_token)?;

        match rejected {
            Some(ref rejected)
                if rejected.expose_secret() != current.access_token.expose_secret() =>
            {
                debug!("Credential already replaced by a concurrent refresh");
                return Ok(current.access_token);
            }
            None if !current.needs_refresh(now, self.refresh_margin) => {
                debug!("Credential refreshed while waiting for the store lock");
                return Ok(current.access_token);
            }
            _ => {}
        }

        let refresh_token = match current.refresh_token.clone() {
            Some(refresh_token) => refresh_token,
            None if rejected.is_none() && !current.is_expired(now) => {
                return Ok(current.access_token);
            }
            None => {
                warn!(fingerprint = %current.fingerprint(), "Credential expired and no refresh token cached");
                return Err(no_cached_token());
            }
        };

        debug!(
            fingerprint = %fingerprint(current.access_token.expose_secret()),
            "Refreshing cached credential"
        );
        let grant = match self.refresh_with_retry(&refresh_token).await {
            Ok(grant) => grant,
            Err(e @ BrokerError::ProviderUnreachable { .. })
                if rejected.is_none() && !current.is_expired(self.clock.now()) =>
            {
                warn!("Refresh failed, serving the still-valid cached credential: {}", e);
                return Ok(current.access_token);
            }
            Err(e) => return Err(e),
        };

        let next = current.refreshed(&grant, self.clock.now());
        let access_token = next.access_token.clone();
        guard.put(next).await?;
        Ok(access_token)
    }

    async fn refresh_with_retry(&self, refresh_token: &Secret<String>) -> Result<TokenGrant> {
        match self.provider.refresh(refresh_token).await {
            Err(e @ BrokerError::ProviderUnreachable { .. }) => {
                warn!("Provider unreachable during refresh, retrying once: {}", e);
                tokio::time::sleep(REFRESH_RETRY_DELAY).await;
                self.provider.refresh(refresh_token).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::system_clock;
    use crate::auth::provider::DevicePoll;
    use crate::auth::test_helpers::{grant, FakeProvider};
    use chrono::Utc;
    use tempfile::TempDir;

    struct SilentPrompt;
    impl DevicePrompt for SilentPrompt {
        fn show(&self, _authorization: &crate::auth::provider::DeviceAuthorization) {}
    }

    fn manager(dir: &TempDir, provider: Arc<FakeProvider>) -> LocalCredentialManager {
        let store = Arc::new(CredentialStore::new(dir.path().join("cache.json")));
        LocalCredentialManager::new(store, provider, system_clock(), Duration::minutes(5))
    }

    async fn seed(manager: &LocalCredentialManager, access: &str, expires_in: Duration, refresh: Option<&str>) {
        let token = CachedToken {
            access_token: Secret::new(access.to_string()),
            refresh_token: refresh.map(|r| Secret::new(r.to_string())),
            expires_at: Utc::now() + expires_in,
            scope: None,
        };
        manager.store.lock().await.unwrap().put(token).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_token_without_cache() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        let err = manager(&dir, provider).get_token().await.unwrap_err();
        assert!(matches!(err, BrokerError::NoCachedCredential { .. }));
        assert!(err.to_string().contains("login"));
    }

    #[tokio::test]
    async fn test_fresh_token_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        let manager = manager(&dir, provider.clone());
        seed(&manager, "cached", Duration::hours(1), Some("rt")).await;

        let token = manager.get_token().await.unwrap();
        assert_eq!(token.expose_secret(), "cached");
        assert_eq!(provider.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_persisted() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        let manager = manager(&dir, provider.clone());
        seed(&manager, "old", Duration::minutes(2), Some("rt-0")).await;

        let token = manager.get_token().await.unwrap();
        assert_eq!(token.expose_secret(), "refreshed-1");
        assert_eq!(provider.seen_refresh_tokens(), vec!["rt-0".to_string()]);

        let reopened = CredentialStore::new(dir.path().join("cache.json"));
        let cached = reopened.get().await.unwrap().unwrap();
        assert_eq!(cached.access_token.expose_secret(), "refreshed-1");
        assert_eq!(cached.refresh_token.unwrap().expose_secret(), "refresh-1");
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        let manager = manager(&dir, provider.clone());
        seed(&manager, "old", Duration::minutes(-1), None).await;

        let err = manager.get_token().await.unwrap_err();
        assert!(matches!(err, BrokerError::NoCachedCredential { .. }));
        assert_eq!(provider.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_refresh_token_surfaces_no_cached_credential() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        provider.fail_refresh();
        let manager = manager(&dir, provider.clone());
        seed(&manager, "old", Duration::minutes(-1), Some("rt")).await;

        let err = manager.get_token().await.unwrap_err();
        assert!(matches!(err, BrokerError::NoCachedCredential { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_retried_once() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        provider.refresh_outages(1);
        let manager = manager(&dir, provider.clone());
        seed(&manager, "old", Duration::minutes(-1), Some("rt")).await;

        let token = manager.get_token().await.unwrap();
        assert_eq!(token.expose_secret(), "refreshed-2");
        assert_eq!(provider.refresh_count(), 2);
    }

    #[tokio::test]
    async fn test_persistent_outage_surfaces_for_expired_token() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        provider.refresh_outages(2);
        let manager = manager(&dir, provider.clone());
        seed(&manager, "old", Duration::minutes(-1), Some("rt")).await;

        let err = manager.get_token().await.unwrap_err();
        assert!(matches!(err, BrokerError::ProviderUnreachable { .. }));
        assert_eq!(provider.refresh_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_refresh() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        provider.set_refresh_delay(std::time::Duration::from_millis(50));
        let manager = manager(&dir, provider.clone());
        seed(&manager, "old", Duration::seconds(-5), Some("rt")).await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_token().await })
            })
            .collect();

        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.expose_secret(), "refreshed-1");
        }
        assert_eq!(provider.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_lose_refresh() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        provider.set_refresh_delay(std::time::Duration::from_millis(100));
        let manager = manager(&dir, provider.clone());
        seed(&manager, "old", Duration::seconds(-5), Some("rt")).await;

        let abandoned =
            tokio::time::timeout(std::time::Duration::from_millis(10), manager.get_token()).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        let token = manager.get_token().await.unwrap();
        assert_eq!(token.expose_secret(), "refreshed-1");
        assert_eq!(provider.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_skips_when_already_replaced() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        let manager = manager(&dir, provider.clone());
        seed(&manager, "current", Duration::hours(1), Some("rt")).await;

        let stale = Secret::new("something-older".to_string());
        let token = manager.force_refresh(&stale).await.unwrap();
        assert_eq!(token.expose_secret(), "current");
        assert_eq!(provider.refresh_count(), 0);

        let rejected = Secret::new("current".to_string());
        let token = manager.force_refresh(&rejected).await.unwrap();
        assert_eq!(token.expose_secret(), "refreshed-1");
        assert_eq!(provider.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_persists_token() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        provider.script_polls(vec![
            DevicePoll::Pending,
            DevicePoll::Granted(grant("fresh", Some("rt"), 3600)),
        ]);
        let manager = manager(&dir, provider);

        manager.acquire(&SilentPrompt).await.unwrap();
        assert_eq!(manager.get_token().await.unwrap().expose_secret(), "fresh");
        assert!(dir.path().join("cache.json").exists());
    }

    #[tokio::test]
    async fn test_logout_clears_cache() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        let manager = manager(&dir, provider);
        seed(&manager, "a", Duration::hours(1), None).await;

        assert!(manager.logout().await.unwrap());
        assert!(!manager.logout().await.unwrap());
        assert!(manager.cached().await.unwrap().is_none());
    }
}
