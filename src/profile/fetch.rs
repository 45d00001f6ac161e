//! Profile fetch with a bounded retry on not-found.
//!
//! Profile rows may be written slightly after the identity they belong to,
//! so a not-found right after sign-up is retried a few times with a fixed
//! delay. Transport errors are returned immediately; the next revalidation
//! cycle picks them up.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Profile, ProfileStore};
use crate::config::SessionConfig;
use crate::error::ProfileError;
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Fixed pause between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_session_config(config: &SessionConfig) -> Self {
        Self {
            attempts: config.profile_fetch_attempts.max(1),
            delay: config.profile_retry_delay(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(Profile),
    /// Every attempt came back not-found
    Missing,
    /// Transport or other non-retryable error
    Failed(ProfileError),
    /// The cancellation token fired while waiting
    Cancelled,
}

pub async fn fetch_with_retry(
    store: &dyn ProfileStore,
    user_id: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> FetchOutcome {
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return FetchOutcome::Cancelled,
            result = store.fetch(user_id) => result,
        };
        telemetry::record_profile_fetch_attempt();

        match result {
            Ok(profile) => {
                debug!(user_id = %user_id, attempt, "Profile fetched");
                return FetchOutcome::Found(profile);
            }
            Err(ProfileError::NotFound) if attempt < attempts => {
                debug!(
                    user_id = %user_id,
                    attempt,
                    max_attempts = attempts,
                    "Profile not found yet, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return FetchOutcome::Cancelled,
                    _ = tokio::time::sleep(policy.delay) => {}
                }
            }
            Err(ProfileError::NotFound) => {
                warn!(
                    user_id = %user_id,
                    attempts,
                    "Profile still missing after retries"
                );
                return FetchOutcome::Missing;
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Profile fetch failed");
                return FetchOutcome::Failed(e);
            }
        }
    }

    FetchOutcome::Missing
}
