//! Credential broker
//!
//! Obtains, caches, verifies and forwards OAuth 2.0 / OpenID Connect
//! credentials on behalf of callers of a downstream API. A local process
//! uses the device-code login and a cached, auto-refreshed token; a network
//! deployment verifies each caller's bearer token and proxies the
//! authorization-code flow with PKCE for public clients.

pub mod auth;
pub mod config;
pub mod error;
pub mod web;

pub use auth::TransportMode;
pub use config::Config;
pub use error::{BrokerError, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "broker.yaml";

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port
pub const DEFAULT_PORT: u16 = 8000;
