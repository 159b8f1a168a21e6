//! Identity of a caller whose bearer token passed verification

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use std::fmt;

/// Verified caller identity, created per request and never persisted.
///
/// Holds the raw bearer token so outbound calls can be made on the caller's
/// behalf; neither `Debug` nor `Display` reveals it.
#[derive(Clone)]
pub struct VerifiedIdentity {
    /// `preferred_username`, falling back to `email` then `upn`
    pub email: Option<String>,
    pub subject: String,
    pub tenant_id: Option<String>,
    /// `oid`, falling back to `sub`
    pub object_id: String,
    pub name: Option<String>,
    pub expires_at: DateTime<Utc>,
    token: Secret<String>,
}

impl VerifiedIdentity {
    pub fn new(
        subject: String,
        object_id: String,
        email: Option<String>,
        tenant_id: Option<String>,
        name: Option<String>,
        expires_at: DateTime<Utc>,
        token: Secret<String>,
    ) -> Self {
        Self {
            email,
            subject,
            tenant_id,
            object_id,
            name,
            expires_at,
            token,
        }
    }

    /// The bearer token this identity was verified from
    pub fn token(&self) -> &Secret<String> {
        &self.token
    }

    /// Email when present, object id otherwise
    pub fn display_name(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.object_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub(crate) fn token_fingerprint(&self) -> String {
        crate::auth::credential_store::fingerprint(self.token.expose_secret())
    }
}

impl fmt::Debug for VerifiedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedIdentity")
            .field("email", &self.email)
            .field("subject", &self.subject)
            .field("tenant_id", &self.tenant_id)
            .field("object_id", &self.object_id)
            .field("expires_at", &self.expires_at)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Display for VerifiedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VerifiedIdentity(email={}, oid={}, tenant={})",
            self.email.as_deref().unwrap_or("-"),
            self.object_id,
            self.tenant_id.as_deref().unwrap_or("-")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> VerifiedIdentity {
        VerifiedIdentity::new(
            "sub-1".to_string(),
            "oid-1".to_string(),
            Some("user@example.com".to_string()),
            Some("tenant-1".to_string()),
            None,
            Utc::now(),
            Secret::new("eyJ.secret.token".to_string()),
        )
    }

    #[test]
    fn test_debug_and_display_hide_token() {
        let identity = identity();
        assert!(!format!("{:?}", identity).contains("eyJ.secret.token"));
        assert!(!format!("{}", identity).contains("eyJ.secret.token"));
        assert!(format!("{}", identity).contains("user@example.com"));
        assert_eq!(identity.token().expose_secret(), "eyJ.secret.token");
    }

    #[test]
    fn test_display_name_falls_back_to_object_id() {
        let mut identity = identity();
        identity.email = None;
        assert_eq!(identity.display_name(), "oid-1");
    }
}
