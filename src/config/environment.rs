//! Environment variable names recognized by the broker

/// Environment variable names used by the credential broker
pub struct EnvVars;

impl EnvVars {
    pub const CONFIG_PATH: &'static str = "BROKER_CONFIG_PATH";
    pub const TENANT_ID: &'static str = "BROKER_TENANT_ID";
    pub const CLIENT_ID: &'static str = "BROKER_CLIENT_ID";
    pub const CLIENT_SECRET: &'static str = "BROKER_CLIENT_SECRET";
    pub const API_SCOPE: &'static str = "BROKER_API_SCOPE";
    pub const AUDIENCE: &'static str = "BROKER_AUDIENCE";
    pub const AUTHORITY: &'static str = "BROKER_AUTHORITY";
    pub const JWKS_URL: &'static str = "BROKER_JWKS_URL";
    pub const PROVIDER_TIMEOUT: &'static str = "BROKER_PROVIDER_TIMEOUT";
    pub const TOKEN_CACHE_PATH: &'static str = "BROKER_TOKEN_CACHE_PATH";
    pub const JWKS_CACHE_TTL: &'static str = "BROKER_JWKS_CACHE_TTL";
    pub const TRANSPORT: &'static str = "BROKER_TRANSPORT";
    pub const API_BASE_URL: &'static str = "BROKER_API_BASE_URL";
    pub const PUBLIC_BASE_URL: &'static str = "BROKER_PUBLIC_BASE_URL";
    pub const HOST: &'static str = "BROKER_HOST";
    pub const PORT: &'static str = "BROKER_PORT";
    pub const LOG_LEVEL: &'static str = "BROKER_LOG_LEVEL";
    pub const LOG_FORMAT: &'static str = "BROKER_LOG_FORMAT";
}
