//! Error types and handling for the credential broker

use actix_web::http::StatusCode;
use thiserror::Error;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Main error type for the credential broker
///
/// The first group of variants is the authentication taxonomy shared by every
/// component. Each one has a stable name returned by [`BrokerError::kind`],
/// which is what remote callers see in error bodies.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// No usable local credential (never logged in, or refresh impossible)
    #[error("No cached credential: {message}")]
    NoCachedCredential { message: String },

    /// Device code expired before the user finished signing in
    #[error("Authorization timed out: {message}")]
    AuthorizationTimeout { message: String },

    /// User declined the device-code sign-in
    #[error("Authorization denied: {message}")]
    AuthorizationDenied { message: String },

    /// Identity provider could not be reached within the timeout
    #[error("Identity provider unreachable: {message}")]
    ProviderUnreachable { message: String },

    /// No key set could be obtained and no acceptable stale copy exists
    #[error("Signing keys unavailable: {message}")]
    KeysUnavailable { message: String },

    /// Token is not a well-formed JWT or uses an unacceptable algorithm
    #[error("Malformed token: {message}")]
    MalformedToken { message: String },

    #[error("Invalid token signature: {message}")]
    SignatureInvalid { message: String },

    #[error("Token expired")]
    TokenExpired,

    #[error("Token not yet valid")]
    TokenNotYetValid,

    #[error("Invalid audience")]
    AudienceMismatch,

    #[error("Invalid issuer")]
    IssuerMismatch,

    /// Request carried no bearer credential
    #[error("Missing bearer token: {message}")]
    MissingToken { message: String },

    /// Proxy session or proxy code is unknown or past its lifetime
    #[error("Unknown or expired session: {message}")]
    UnknownOrExpiredSession { message: String },

    #[error("PKCE verification failed")]
    PkceMismatch,

    #[error("Authorization code already used")]
    CodeAlreadyUsed,

    /// Malformed OAuth protocol request
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Grant parameters do not match the proxy session
    #[error("Invalid grant: {message}")]
    InvalidGrant { message: String },

    /// Client identifier does not match the configured client
    #[error("Invalid client: {message}")]
    InvalidClient { message: String },

    /// Identity provider answered with an error
    #[error("Identity provider error: {code}: {message}")]
    Provider { code: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Credential cache read/write errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BrokerError {
    pub fn no_cached_credential<S: Into<String>>(message: S) -> Self {
        Self::NoCachedCredential {
            message: message.into(),
        }
    }

    pub fn authorization_timeout<S: Into<String>>(message: S) -> Self {
        Self::AuthorizationTimeout {
            message: message.into(),
        }
    }

    pub fn authorization_denied<S: Into<String>>(message: S) -> Self {
        Self::AuthorizationDenied {
            message: message.into(),
        }
    }

    pub fn provider_unreachable<S: Into<String>>(message: S) -> Self {
        Self::ProviderUnreachable {
            message: message.into(),
        }
    }

    pub fn keys_unavailable<S: Into<String>>(message: S) -> Self {
        Self::KeysUnavailable {
            message: message.into(),
        }
    }

    pub fn malformed_token<S: Into<String>>(message: S) -> Self {
        Self::MalformedToken {
            message: message.into(),
        }
    }

    pub fn signature_invalid<S: Into<String>>(message: S) -> Self {
        Self::SignatureInvalid {
            message: message.into(),
        }
    }

    pub fn missing_token<S: Into<String>>(message: S) -> Self {
        Self::MissingToken {
            message: message.into(),
        }
    }

    pub fn unknown_session<S: Into<String>>(message: S) -> Self {
        Self::UnknownOrExpiredSession {
            message: message.into(),
        }
    }

    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn invalid_grant<S: Into<String>>(message: S) -> Self {
        Self::InvalidGrant {
            message: message.into(),
        }
    }

    pub fn invalid_client<S: Into<String>>(message: S) -> Self {
        Self::InvalidClient {
            message: message.into(),
        }
    }

    pub fn provider<C: Into<String>, S: Into<String>>(code: C, message: S) -> Self {
        Self::Provider {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Stable taxonomy name, safe to expose to remote callers
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::NoCachedCredential { .. } => "NoCachedCredential",
            BrokerError::AuthorizationTimeout { .. } => "AuthorizationTimeout",
            BrokerError::AuthorizationDenied { .. } => "AuthorizationDenied",
            BrokerError::ProviderUnreachable { .. } => "ProviderUnreachable",
            BrokerError::KeysUnavailable { .. } => "KeysUnavailable",
            BrokerError::MalformedToken { .. } => "MalformedToken",
            BrokerError::SignatureInvalid { .. } => "SignatureInvalid",
            BrokerError::TokenExpired => "TokenExpired",
            BrokerError::TokenNotYetValid => "TokenNotYetValid",
            BrokerError::AudienceMismatch => "AudienceMismatch",
            BrokerError::IssuerMismatch => "IssuerMismatch",
            BrokerError::MissingToken { .. } => "MissingToken",
            BrokerError::UnknownOrExpiredSession { .. } => "UnknownOrExpiredSession",
            BrokerError::PkceMismatch => "PKCEMismatch",
            BrokerError::CodeAlreadyUsed => "CodeAlreadyUsed",
            BrokerError::InvalidRequest { .. } => "InvalidRequest",
            BrokerError::InvalidGrant { .. } => "InvalidGrant",
            BrokerError::InvalidClient { .. } => "InvalidClient",
            BrokerError::Provider { .. } => "ProviderError",
            BrokerError::Config { .. } => "ConfigError",
            BrokerError::Storage { .. } => "StorageError",
            BrokerError::Io(_) => "IoError",
            BrokerError::Serde(_) => "SerializationError",
            BrokerError::Yaml(_) => "YamlError",
            BrokerError::Http(_) => "HttpError",
            BrokerError::Internal(_) => "InternalError",
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            BrokerError::NoCachedCredential { .. }
            | BrokerError::AuthorizationTimeout { .. }
            | BrokerError::AuthorizationDenied { .. } => "local_credentials",
            BrokerError::ProviderUnreachable { .. } | BrokerError::Provider { .. } => "provider",
            BrokerError::KeysUnavailable { .. } => "key_ring",
            BrokerError::MalformedToken { .. }
            | BrokerError::SignatureInvalid { .. }
            | BrokerError::TokenExpired
            | BrokerError::TokenNotYetValid
            | BrokerError::AudienceMismatch
            | BrokerError::IssuerMismatch
            | BrokerError::MissingToken { .. } => "token",
            BrokerError::UnknownOrExpiredSession { .. }
            | BrokerError::PkceMismatch
            | BrokerError::CodeAlreadyUsed
            | BrokerError::InvalidRequest { .. }
            | BrokerError::InvalidGrant { .. }
            | BrokerError::InvalidClient { .. } => "oauth_proxy",
            BrokerError::Config { .. } => "config",
            BrokerError::Storage { .. } | BrokerError::Io(_) => "storage",
            BrokerError::Serde(_) => "serialization",
            BrokerError::Yaml(_) => "yaml",
            BrokerError::Http(_) => "http",
            BrokerError::Internal(_) => "internal",
        }
    }

    /// Check if this error is retryable
    ///
    /// Token and session errors are never retryable: a used proxy code or a
    /// rejected token stays rejected.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::ProviderUnreachable { .. }
                | BrokerError::KeysUnavailable { .. }
                | BrokerError::Http(_)
        )
    }

    /// True for errors that describe a rejected bearer credential
    pub fn is_token_rejection(&self) -> bool {
        self.category() == "token"
    }

    /// HTTP status used when this error reaches a remote caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            BrokerError::MalformedToken { .. }
            | BrokerError::SignatureInvalid { .. }
            | BrokerError::TokenExpired
            | BrokerError::TokenNotYetValid
            | BrokerError::AudienceMismatch
            | BrokerError::IssuerMismatch
            | BrokerError::MissingToken { .. }
            | BrokerError::NoCachedCredential { .. } => StatusCode::UNAUTHORIZED,
            BrokerError::UnknownOrExpiredSession { .. }
            | BrokerError::PkceMismatch
            | BrokerError::CodeAlreadyUsed
            | BrokerError::InvalidRequest { .. }
            | BrokerError::InvalidGrant { .. }
            | BrokerError::InvalidClient { .. } => StatusCode::BAD_REQUEST,
            BrokerError::ProviderUnreachable { .. }
            | BrokerError::KeysUnavailable { .. }
            | BrokerError::Provider { .. }
            | BrokerError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short caller-facing reason. Never includes token material.
    pub fn public_message(&self) -> String {
        match self {
            BrokerError::TokenExpired => {
                "Token expired. Please refresh your authentication.".to_string()
            }
            BrokerError::TokenNotYetValid => "Token is not yet valid.".to_string(),
            BrokerError::AudienceMismatch => {
                "Token validation failed: Invalid audience.".to_string()
            }
            BrokerError::IssuerMismatch => "Token validation failed: Invalid issuer.".to_string(),
            BrokerError::SignatureInvalid { .. } => "Invalid token signature.".to_string(),
            BrokerError::MalformedToken { .. } => {
                "Invalid token format. Expected JWT Bearer token.".to_string()
            }
            BrokerError::MissingToken { message } => message.clone(),
            BrokerError::KeysUnavailable { .. } => {
                "Unable to verify token: signing keys unavailable.".to_string()
            }
            BrokerError::PkceMismatch => "PKCE verification failed.".to_string(),
            BrokerError::CodeAlreadyUsed => "Authorization code has already been used.".to_string(),
            BrokerError::UnknownOrExpiredSession { .. } => {
                "Invalid or expired authorization code.".to_string()
            }
            BrokerError::InvalidRequest { message }
            | BrokerError::InvalidGrant { message }
            | BrokerError::InvalidClient { message } => message.clone(),
            BrokerError::ProviderUnreachable { .. } | BrokerError::Provider { .. } => {
                "Identity provider request failed.".to_string()
            }
            other => other.to_string(),
        }
    }

    /// RFC 6749 error code for token and authorization endpoint responses
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            BrokerError::UnknownOrExpiredSession { .. }
            | BrokerError::PkceMismatch
            | BrokerError::CodeAlreadyUsed
            | BrokerError::InvalidGrant { .. } => "invalid_grant",
            BrokerError::InvalidRequest { .. } => "invalid_request",
            BrokerError::InvalidClient { .. } => "invalid_client",
            BrokerError::ProviderUnreachable { .. } => "temporarily_unavailable",
            _ => "server_error",
        }
    }

    /// Next step a local user should take, if there is an obvious one
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            BrokerError::NoCachedCredential { .. } => {
                Some("Run the `login` command to authenticate.")
            }
            BrokerError::AuthorizationTimeout { .. } => {
                Some("The sign-in code expired. Run the `login` command again.")
            }
            BrokerError::AuthorizationDenied { .. } => {
                Some("Sign-in was declined. Run the `login` command again to retry.")
            }
            BrokerError::ProviderUnreachable { .. } => {
                Some("Check network connectivity to the identity provider and retry.")
            }
            BrokerError::TokenExpired => Some("Refresh your authentication and retry."),
            _ => None,
        }
    }
}

impl Clone for BrokerError {
    fn clone(&self) -> Self {
        match self {
            BrokerError::NoCachedCredential { message } => Self::no_cached_credential(message.clone()),
            BrokerError::AuthorizationTimeout { message } => {
                Self::authorization_timeout(message.clone())
            }
            BrokerError::AuthorizationDenied { message } => {
                Self::authorization_denied(message.clone())
            }
            BrokerError::ProviderUnreachable { message } => {
                Self::provider_unreachable(message.clone())
            }
            BrokerError::KeysUnavailable { message } => Self::keys_unavailable(message.clone()),
            BrokerError::MalformedToken { message } => Self::malformed_token(message.clone()),
            BrokerError::SignatureInvalid { message } => Self::signature_invalid(message.clone()),
            BrokerError::TokenExpired => BrokerError::TokenExpired,
            BrokerError::TokenNotYetValid => BrokerError::TokenNotYetValid,
            BrokerError::AudienceMismatch => BrokerError::AudienceMismatch,
            BrokerError::IssuerMismatch => BrokerError::IssuerMismatch,
            BrokerError::MissingToken { message } => Self::missing_token(message.clone()),
            BrokerError::UnknownOrExpiredSession { message } => {
                Self::unknown_session(message.clone())
            }
            BrokerError::PkceMismatch => BrokerError::PkceMismatch,
            BrokerError::CodeAlreadyUsed => BrokerError::CodeAlreadyUsed,
            BrokerError::InvalidRequest { message } => Self::invalid_request(message.clone()),
            BrokerError::InvalidGrant { message } => Self::invalid_grant(message.clone()),
            BrokerError::InvalidClient { message } => Self::invalid_client(message.clone()),
            BrokerError::Provider { code, message } => Self::provider(code.clone(), message.clone()),
            BrokerError::Config { message } => Self::config(message.clone()),
            BrokerError::Storage { message } => Self::storage(message.clone()),

            // For non-cloneable types, convert to string representation
            BrokerError::Io(e) => Self::storage(format!("IO error: {}", e)),
            BrokerError::Serde(e) => Self::storage(format!("Serialization error: {}", e)),
            BrokerError::Yaml(e) => Self::config(format!("YAML error: {}", e)),
            BrokerError::Http(e) => Self::provider_unreachable(e.to_string()),
            BrokerError::Internal(e) => BrokerError::Internal(anyhow::anyhow!(e.to_string())),
        }
    }
}

impl actix_web::ResponseError for BrokerError {
    fn status_code(&self) -> StatusCode {
        BrokerError::status_code(self)
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(BrokerError::status_code(self)).json(serde_json::json!({
            "error": self.kind(),
            "message": self.public_message(),
        }))
    }
}
