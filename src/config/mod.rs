//! Configuration module for the credential broker
//!
//! Precedence, lowest first: defaults, YAML file, `.env` files, `BROKER_*`
//! environment variables, command line flags.

mod config;
mod environment;

pub use config::{
    Config, DownstreamConfig, IdentityConfig, LocalCredentialConfig, LoggingConfig,
    OAuthProxyConfig, ServerConfig, ValidationConfig, DEFAULT_AUTHORITY,
};
pub use environment::EnvVars;
