//! Durable single-record cache for the local-mode credential
//!
//! The record lives in a JSON file readable only by the owner. All access goes
//! through [`CredentialStore::lock`], which hands out a guard over the one
//! in-memory copy; the guard is an async mutex guard so it can be held across
//! a provider refresh.

use crate::auth::provider::TokenGrant;
use crate::auth::secret_serde::{option_secret_string, secret_string};
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Lifetime assumed when the provider omits `expires_in`
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Cached local credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedToken {
    #[serde(with = "secret_string")]
    pub access_token: Secret<String>,
    #[serde(default, with = "option_secret_string")]
    pub refresh_token: Option<Secret<String>>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl CachedToken {
    pub fn from_grant(grant: &TokenGrant, now: DateTime<Utc>) -> Self {
        let lifetime = grant.expires_in.map(|s| s as i64).unwrap_or(DEFAULT_EXPIRES_IN);
        Self {
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token.clone(),
            expires_at: now + Duration::seconds(lifetime),
            scope: grant.scope.clone(),
        }
    }

    /// Apply a refresh response; providers may omit a rotated refresh token
    pub fn refreshed(&self, grant: &TokenGrant, now: DateTime<Utc>) -> Self {
        let mut next = Self::from_grant(grant, now);
        if next.refresh_token.is_none() {
            next.refresh_token = self.refresh_token.clone();
        }
        if next.scope.is_none() {
            next.scope = self.scope.clone();
        }
        next
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the token expires within `margin`
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin >= self.expires_at
    }

    /// Short non-reversible identifier for log correlation
    pub fn fingerprint(&self) -> String {
        fingerprint(self.access_token.expose_secret())
    }
}

/// First 8 hex characters of the SHA-256 of a token
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..4])
}

#[derive(Debug, Default)]
struct Slot {
    loaded: bool,
    token: Option<CachedToken>,
}

/// File-backed credential store
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    slot: Mutex<Slot>,
}

/// Exclusive access to the cached record
pub struct CredentialGuard<'a> {
    store: &'a CredentialStore,
    slot: MutexGuard<'a, Slot>,
}

impl CredentialStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the store lock, loading the record from disk on first use
    pub async fn lock(&self) -> Result<CredentialGuard<'_>> {
        let mut slot = self.slot.lock().await;
        if !slot.loaded {
            slot.token = self.read_from_disk().await?;
            slot.loaded = true;
        }
        Ok(CredentialGuard { store: self, slot })
    }

    /// Snapshot of the cached record
    pub async fn get(&self) -> Result<Option<CachedToken>> {
        Ok(self.lock().await?.token().cloned())
    }

    async fn read_from_disk(&self) -> Result<Option<CachedToken>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Zeroizing::new(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No token cache file");
                return Ok(None);
            }
            Err(e) => {
                return Err(BrokerError::storage(format!(
                    "Failed to read token cache {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        match serde_json::from_str::<CachedToken>(&content) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(path = %self.path.display(), "Ignoring unreadable token cache: {}", e);
                Ok(None)
            }
        }
    }

    async fn write_to_disk(&self, token: &CachedToken) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !tokio::fs::try_exists(parent).await? {
                tokio::fs::create_dir_all(parent).await?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                        .await?;
                }
            }
        }

        let body = Zeroizing::new(serde_json::to_vec_pretty(token)?);
        let tmp_path = self.path.with_extension("json.tmp");

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp_path).await.map_err(|e| {
            BrokerError::storage(format!("Failed to open {}: {}", tmp_path.display(), e))
        })?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            BrokerError::storage(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }

    async fn remove_from_disk(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl<'a> CredentialGuard<'a> {
    pub fn token(&self) -> Option<&CachedToken> {
        self.slot.token.as_ref()
    }

    /// Persist then publish a new record. On a write failure the previous
    /// record stays in place.
    pub async fn put(&mut self, token: CachedToken) -> Result<()> {
        self.store.write_to_disk(&token).await?;
        info!(
            fingerprint = %token.fingerprint(),
            expires_at = %token.expires_at,
            "Cached credential updated"
        );
        self.slot.token = Some(token);
        Ok(())
    }

    /// Remove the record from memory and disk
    pub async fn clear(&mut self) -> Result<()> {
        self.store.remove_from_disk().await?;
        self.slot.token = None;
        info!(path = %self.store.path.display(), "Cached credential cleared");
        Ok(())
    }
}
