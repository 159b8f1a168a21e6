//! Device Authorization Grant (RFC 8628) polling loop

use crate::auth::provider::{DeviceAuthorization, DevicePoll, IdentityProvider, TokenGrant};
use crate::error::{BrokerError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Interval used when the provider does not send one
const DEFAULT_POLL_INTERVAL: u64 = 5;
/// Added to the interval on every `slow_down`
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Where device-code instructions are shown
pub trait DevicePrompt: Send + Sync {
    fn show(&self, authorization: &DeviceAuthorization);
}

/// Prints the instructions on stderr so stdout stays free for protocol traffic
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrPrompt;

impl DevicePrompt for StderrPrompt {
    fn show(&self, authorization: &DeviceAuthorization) {
        eprintln!("\n{}", authorization.user_instructions());
        eprintln!(
            "The code expires in {} minutes. Waiting for sign-in to complete...\n",
            authorization.expires_in / 60
        );
    }
}

/// Drives one device-code login to completion
#[derive(Clone)]
pub struct DeviceCodeFlow {
    provider: Arc<dyn IdentityProvider>,
}

impl DeviceCodeFlow {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }

    /// Start the grant, show the prompt and poll until the user finishes.
    ///
    /// Fails with `AuthorizationTimeout` when the device code expires,
    /// `AuthorizationDenied` when the user declines, and
    /// `ProviderUnreachable` when the provider cannot be reached.
    pub async fn run(&self, prompt: &dyn DevicePrompt) -> Result<TokenGrant> {
        let authorization = self.provider.start_device_authorization().await?;
        prompt.show(&authorization);

        let deadline = Instant::now() + Duration::from_secs(authorization.expires_in);
        self.poll_until_complete(&authorization, deadline).await
    }

    async fn poll_until_complete(
        &self,
        authorization: &DeviceAuthorization,
        deadline: Instant,
    ) -> Result<TokenGrant> {
        let mut interval =
            Duration::from_secs(authorization.interval.unwrap_or(DEFAULT_POLL_INTERVAL));
        let mut attempts: u32 = 0;
        let mut unreachable = false;

        loop {
            attempts += 1;
            let poll = match self.provider.poll_device_token(&authorization.device_code).await {
                Ok(poll) => {
                    unreachable = false;
                    Some(poll)
                }
                // one outage in a row is retried on the next interval
                Err(e @ BrokerError::ProviderUnreachable { .. }) if !unreachable => {
                    warn!(attempts, "Token poll failed, retrying on the next interval: {}", e);
                    unreachable = true;
                    None
                }
                Err(e) => return Err(e),
            };

            match poll {
                None => {}
                Some(DevicePoll::Granted(grant)) => {
                    info!(attempts, "Device authorization completed");
                    return Ok(grant);
                }
                Some(DevicePoll::Pending) => {
                    debug!(attempts, "Authorization pending");
                }
                Some(DevicePoll::SlowDown) => {
                    interval += SLOW_DOWN_STEP;
                    debug!(interval_secs = interval.as_secs(), "Provider requested slower polling");
                }
                Some(DevicePoll::Denied) => {
                    warn!("User declined device authorization");
                    return Err(BrokerError::authorization_denied(
                        "The sign-in request was declined",
                    ));
                }
                Some(DevicePoll::Expired) => {
                    warn!("Device code expired during polling");
                    return Err(BrokerError::authorization_timeout(
                        "The device code expired before sign-in completed",
                    ));
                }
            }

            if Instant::now() + interval >= deadline {
                warn!(attempts, "Device code lifetime elapsed while polling");
                return Err(BrokerError::authorization_timeout(
                    "Sign-in was not completed before the device code expired",
                ));
            }
            tokio::time::sleep(interval).await;
        }
    }
}
