//! Authentication module for the credential broker
//!
//! Local mode keeps one user's device-code credential cached and refreshed.
//! Remote mode verifies caller bearer tokens against the provider's published
//! keys and proxies the authorization-code flow for public clients. Both feed
//! the outbound client that calls the downstream API.

pub mod clock;
pub mod credential_store;
pub mod device_code;
pub mod jwt;
pub mod key_ring;
pub mod local_credentials;
pub mod middleware;
pub mod oauth;
pub mod oauth_session;
pub mod outbound;
pub mod pkce;
pub mod provider;
pub(crate) mod secret_serde;
pub mod transport;
pub mod user_context;

#[cfg(test)]
pub mod test_helpers;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use credential_store::{CachedToken, CredentialStore};
pub use device_code::{DeviceCodeFlow, DevicePrompt, StderrPrompt};
pub use jwt::{extract_bearer, BearerTokenValidator, TokenClaims};
pub use key_ring::{KeyRingCache, KeySet};
pub use local_credentials::LocalCredentialManager;
pub use middleware::{default_bypass_paths, verified_identity, BearerAuthMiddleware};
pub use oauth::{configure_oauth_routes, OAuthProxy, TokenResponse};
pub use oauth_session::{OAuthSessionStore, ProxySession, SessionState};
pub use outbound::{DownstreamClient, OutboundCredentials, OutboundRequest};
pub use provider::{
    DeviceAuthorization, DevicePoll, IdentityProvider, KeySource, OidcProvider, TokenGrant,
};
pub use transport::{select_strategy, TransportMode};
pub use user_context::VerifiedIdentity;
