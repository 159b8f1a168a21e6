//! Error handling module for the credential broker
//!
//! One error enum covers the authentication taxonomy and the ambient failures
//! (configuration, storage, HTTP).

mod error;

// Re-export the main error types
pub use error::{BrokerError, Result};
