//! Transport mode selection

use crate::config::Config;
use crate::error::{BrokerError, Result};
use std::fmt;

/// How callers reach the broker, which decides where credentials come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Single user on the local machine, credential from the device-code login
    Local,
    /// Network callers, each presenting its own bearer token
    Remote,
}

impl TransportMode {
    /// Parse an explicit mode. `auto` resolves to local.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "stdio" | "auto" | "" => Ok(TransportMode::Local),
            "remote" | "sse" | "http" => Ok(TransportMode::Remote),
            other => Err(BrokerError::config(format!(
                "Invalid transport mode '{}' (valid options: local, remote, auto)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Local => "local",
            TransportMode::Remote => "remote",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the credential strategy for this process. Pure: depends only on
/// configuration, so it is stable for the process lifetime.
pub fn select_strategy(config: &Config) -> Result<TransportMode> {
    match config.transport.as_deref() {
        None => Ok(TransportMode::Local),
        Some(value) => TransportMode::parse(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_transport(value: Option<&str>) -> Config {
        let mut config = Config::default();
        config.transport = value.map(String::from);
        config
    }

    #[test]
    fn test_unset_and_auto_default_to_local() {
        assert_eq!(select_strategy(&with_transport(None)).unwrap(), TransportMode::Local);
        assert_eq!(select_strategy(&with_transport(Some("auto"))).unwrap(), TransportMode::Local);
    }

    #[test]
    fn test_explicit_modes_are_honoured() {
        assert_eq!(select_strategy(&with_transport(Some("remote"))).unwrap(), TransportMode::Remote);
        assert_eq!(select_strategy(&with_transport(Some("SSE"))).unwrap(), TransportMode::Remote);
        assert_eq!(select_strategy(&with_transport(Some("stdio"))).unwrap(), TransportMode::Local);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(select_strategy(&with_transport(Some("carrier-pigeon"))).is_err());
    }
}
