//! Configuration structures for the credential broker

use crate::auth::secret_serde::option_secret_string;
use crate::config::environment::EnvVars;
use crate::error::{BrokerError, Result};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default identity provider authority
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

fn default_host() -> String {
    crate::DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    crate::DEFAULT_PORT
}
fn default_authority() -> String {
    DEFAULT_AUTHORITY.to_string()
}
fn default_provider_timeout() -> u64 { 10 }
fn default_refresh_margin() -> u64 { 300 }
fn default_jwks_cache_ttl() -> u64 { 3600 }
fn default_jwks_max_stale() -> u64 { 86_400 }
fn default_clock_leeway() -> u64 { 60 }
fn default_jwks_refresh_cooldown() -> u64 { 30 }
fn default_session_ttl() -> u64 { 600 }
fn default_code_ttl() -> u64 { 300 }
fn default_sweep_interval() -> u64 { 60 }
fn default_true() -> bool { true }
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings (remote mode)
    #[serde(default)]
    pub server: ServerConfig,
    /// Identity provider and application registration
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Local (device-code) credential settings
    #[serde(default)]
    pub local: LocalCredentialConfig,
    /// Bearer token validation settings
    #[serde(default)]
    pub validation: ValidationConfig,
    /// OAuth proxy settings
    #[serde(default)]
    pub oauth_proxy: OAuthProxyConfig,
    /// Downstream API settings
    #[serde(default)]
    pub downstream: DownstreamConfig,
    /// Transport mode: "local", "remote" or "auto" (unset means auto)
    #[serde(default)]
    pub transport: Option<String>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally visible base URL, used to build the OAuth callback URL.
    /// When unset the callback URL is derived from the incoming request.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_base_url: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BrokerError::config("server.host cannot be empty"));
        }
        if self.port == 0 {
            return Err(BrokerError::config("server.port must be greater than 0"));
        }
        if let Some(ref base) = self.public_base_url {
            url::Url::parse(base).map_err(|e| {
                BrokerError::config(format!("Invalid server.public_base_url '{}': {}", base, e))
            })?;
        }
        Ok(())
    }

    /// True when `host` only accepts connections from this machine
    pub fn is_loopback(&self) -> bool {
        let host = self.host.trim().trim_start_matches('[').trim_end_matches(']');
        host.eq_ignore_ascii_case("localhost")
            || host
                .parse::<std::net::IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
    }
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Directory tenant identifier
    #[serde(default)]
    pub tenant_id: String,
    /// Application (client) identifier
    #[serde(default)]
    pub client_id: String,
    /// Confidential client secret, required by the OAuth proxy code exchange
    #[serde(default, with = "option_secret_string", skip_serializing)]
    pub client_secret: Option<Secret<String>>,
    /// Scope requested for the downstream API
    #[serde(default)]
    pub api_scope: String,
    /// Expected `aud` claim; defaults to the client id
    #[serde(default)]
    pub audience: Option<String>,
    /// Authority base URL
    #[serde(default = "default_authority")]
    pub authority: String,
    /// Expected `iss` claim; defaults to `{authority}/{tenant}/v2.0`
    #[serde(default)]
    pub issuer: Option<String>,
    /// JWKS endpoint; defaults to `{authority}/{tenant}/discovery/v2.0/keys`
    #[serde(default)]
    pub jwks_url: Option<String>,
    /// Timeout for every identity provider call, in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: None,
            api_scope: String::new(),
            audience: None,
            authority: default_authority(),
            issuer: None,
            jwks_url: None,
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl IdentityConfig {
    fn tenant_base(&self) -> String {
        format!("{}/{}", self.authority.trim_end_matches('/'), self.tenant_id)
    }

    pub fn device_code_url(&self) -> String {
        format!("{}/oauth2/v2.0/devicecode", self.tenant_base())
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.tenant_base())
    }

    pub fn authorize_url(&self) -> String {
        format!("{}/oauth2/v2.0/authorize", self.tenant_base())
    }

    pub fn jwks_url(&self) -> String {
        self.jwks_url
            .clone()
            .unwrap_or_else(|| format!("{}/discovery/v2.0/keys", self.tenant_base()))
    }

    pub fn issuer(&self) -> String {
        self.issuer
            .clone()
            .unwrap_or_else(|| format!("{}/v2.0", self.tenant_base()))
    }

    pub fn audience(&self) -> String {
        self.audience.clone().unwrap_or_else(|| self.client_id.clone())
    }

    /// Scopes requested by the device-code login
    pub fn device_scopes(&self) -> String {
        if self.api_scope.is_empty() {
            "offline_access".to_string()
        } else {
            format!("{} offline_access", self.api_scope)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(BrokerError::config(format!(
                "identity.tenant_id is required (or set {})",
                EnvVars::TENANT_ID
            )));
        }
        if self.client_id.trim().is_empty() {
            return Err(BrokerError::config(format!(
                "identity.client_id is required (or set {})",
                EnvVars::CLIENT_ID
            )));
        }
        url::Url::parse(&self.authority).map_err(|e| {
            BrokerError::config(format!("Invalid identity.authority '{}': {}", self.authority, e))
        })?;
        if let Some(ref jwks) = self.jwks_url {
            url::Url::parse(jwks).map_err(|e| {
                BrokerError::config(format!("Invalid identity.jwks_url '{}': {}", jwks, e))
            })?;
        }
        if self.timeout_secs == 0 {
            return Err(BrokerError::config("identity.timeout_secs must be greater than 0"));
        }
        Ok(())
    }
}

/// Local credential (device-code) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCredentialConfig {
    /// Token cache file; defaults to `<config dir>/credential-broker/token_cache.json`
    #[serde(default)]
    pub token_cache_path: Option<PathBuf>,
    /// Refresh the access token when it expires within this many seconds
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
}

impl Default for LocalCredentialConfig {
    fn default() -> Self {
        Self {
            token_cache_path: None,
            refresh_margin_secs: default_refresh_margin(),
        }
    }
}

impl LocalCredentialConfig {
    /// Resolved cache path
    pub fn cache_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.token_cache_path {
            return Ok(path.clone());
        }
        let base = dirs::config_dir()
            .ok_or_else(|| BrokerError::config("Unable to determine the user config directory"))?;
        Ok(base.join(env!("CARGO_PKG_NAME")).join("token_cache.json"))
    }

    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_margin_secs as i64)
    }
}

/// Bearer token validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// How long a fetched key set is served without refetching, in seconds
    #[serde(default = "default_jwks_cache_ttl")]
    pub jwks_cache_ttl_secs: u64,
    /// Oldest key set still served when the provider is unreachable, in seconds
    #[serde(default = "default_jwks_max_stale")]
    pub jwks_max_stale_secs: u64,
    /// Allowed clock skew for `exp`/`nbf`, in seconds
    #[serde(default = "default_clock_leeway")]
    pub clock_leeway_secs: u64,
    /// Minimum time between forced key refreshes on an unknown `kid`, in seconds
    #[serde(default = "default_jwks_refresh_cooldown")]
    pub jwks_refresh_cooldown_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            jwks_cache_ttl_secs: default_jwks_cache_ttl(),
            jwks_max_stale_secs: default_jwks_max_stale(),
            clock_leeway_secs: default_clock_leeway(),
            jwks_refresh_cooldown_secs: default_jwks_refresh_cooldown(),
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.jwks_cache_ttl_secs == 0 {
            return Err(BrokerError::config("validation.jwks_cache_ttl_secs must be greater than 0"));
        }
        if self.jwks_max_stale_secs < self.jwks_cache_ttl_secs {
            return Err(BrokerError::config(
                "validation.jwks_max_stale_secs must not be lower than jwks_cache_ttl_secs",
            ));
        }
        Ok(())
    }
}

/// OAuth proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProxyConfig {
    /// Serve /authorize, /callback and /token
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lifetime of a proxy session from /authorize, in seconds
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Lifetime of an issued proxy code, in seconds
    #[serde(default = "default_code_ttl")]
    pub code_ttl_secs: u64,
    /// Interval of the background expired-session sweep, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for OAuthProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            session_ttl_secs: default_session_ttl(),
            code_ttl_secs: default_code_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl OAuthProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session_ttl_secs == 0 || self.code_ttl_secs == 0 {
            return Err(BrokerError::config("oauth_proxy lifetimes must be greater than 0"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(BrokerError::config("oauth_proxy.sweep_interval_secs must be greater than 0"));
        }
        Ok(())
    }
}

/// Downstream API configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownstreamConfig {
    /// Base URL of the protected API
    #[serde(default)]
    pub api_base_url: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (json, text)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.to_lowercase().as_str()) {
            return Err(BrokerError::config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.level,
                valid_levels.join(", ")
            )));
        }
        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(BrokerError::config(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.format,
                valid_formats.join(", ")
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load .env files in order of precedence
    fn load_env_files() {
        for env_file in [".env", ".env.local"] {
            match dotenvy::from_filename(env_file) {
                Ok(_) => tracing::info!("Loaded environment variables from {}", env_file),
                Err(e) if e.not_found() => {
                    tracing::debug!("No {} file found, skipping", env_file);
                }
                Err(e) => tracing::warn!("Failed to load {}: {}", env_file, e),
            }
        }
    }

    /// Load configuration from an optional file, `.env` files and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_env_files();

        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(EnvVars::CONFIG_PATH).ok().map(PathBuf::from));

        let mut config = match path {
            Some(ref path) if path.exists() => Self::from_file(path)?,
            Some(ref path) => {
                return Err(BrokerError::config(format!(
                    "Config file not found: {}",
                    path.display()
                )))
            }
            None => {
                let default_path = Path::new(crate::DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_environment_overrides()?;
        Ok(config)
    }

    /// Parse a YAML configuration file without applying overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&content)
            .map_err(|e| BrokerError::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply `BROKER_*` environment variable overrides
    pub fn apply_environment_overrides(&mut self) -> Result<()> {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        fn parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
        where
            T::Err: std::fmt::Display,
        {
            match var(name) {
                Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
                    BrokerError::config(format!("Invalid {} environment variable: {}", name, e))
                }),
                None => Ok(None),
            }
        }

        if let Some(v) = var(EnvVars::TENANT_ID) {
            self.identity.tenant_id = v;
        }
        if let Some(v) = var(EnvVars::CLIENT_ID) {
            self.identity.client_id = v;
        }
        if let Some(v) = var(EnvVars::CLIENT_SECRET) {
            self.identity.client_secret = Some(Secret::new(v));
        }
        if let Some(v) = var(EnvVars::API_SCOPE) {
            self.identity.api_scope = v;
        }
        if let Some(v) = var(EnvVars::AUDIENCE) {
            self.identity.audience = Some(v);
        }
        if let Some(v) = var(EnvVars::AUTHORITY) {
            self.identity.authority = v;
        }
        if let Some(v) = var(EnvVars::JWKS_URL) {
            self.identity.jwks_url = Some(v);
        }
        if let Some(v) = parse(EnvVars::PROVIDER_TIMEOUT)? {
            self.identity.timeout_secs = v;
        }
        if let Some(v) = var(EnvVars::TOKEN_CACHE_PATH) {
            self.local.token_cache_path = Some(PathBuf::from(v));
        }
        if let Some(v) = parse(EnvVars::JWKS_CACHE_TTL)? {
            self.validation.jwks_cache_ttl_secs = v;
        }
        if let Some(v) = var(EnvVars::TRANSPORT) {
            self.transport = Some(v);
        }
        if let Some(v) = var(EnvVars::API_BASE_URL) {
            self.downstream.api_base_url = Some(v);
        }
        if let Some(v) = var(EnvVars::PUBLIC_BASE_URL) {
            self.server.public_base_url = Some(v);
        }
        if let Some(v) = var(EnvVars::HOST) {
            self.server.host = v;
        }
        if let Some(v) = parse(EnvVars::PORT)? {
            self.server.port = v;
        }
        if let Some(v) = var(EnvVars::LOG_LEVEL) {
            self.logging.level = v;
        }
        if let Some(v) = var(EnvVars::LOG_FORMAT) {
            self.logging.format = v;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.identity.validate()?;
        self.validation.validate()?;
        self.oauth_proxy.validate()?;
        self.logging.validate()?;

        if let Some(ref base) = self.downstream.api_base_url {
            url::Url::parse(base).map_err(|e| {
                BrokerError::config(format!("Invalid downstream.api_base_url '{}': {}", base, e))
            })?;
        }
        // local mode attaches the user's own credential to unauthenticated
        // requests, so it must never listen beyond this machine
        let mode = crate::auth::select_strategy(self)?;
        if mode == crate::auth::TransportMode::Local && !self.server.is_loopback() {
            return Err(BrokerError::config(format!(
                "server.host '{}' is not a loopback address; local transport only binds to \
                 127.0.0.1, ::1 or localhost (use transport: remote to serve the network)",
                self.server.host
            )));
        }
        Ok(())
    }
}
