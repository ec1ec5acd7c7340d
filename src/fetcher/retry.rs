//! Exponential backoff retry for any [`FeedClient`].
//!
//! # Retry Strategy
//!
//! - Up to `max_retries` retries after the first attempt
//! - Delay before retry `n` is `base_delay * 2^(n-1)`, capped at `max_delay`
//! - Optional random jitter (`0..=jitter`) added to every sleep
//!
//! The delay computation lives in [`backoff_delay`], a pure function, so it
//! can be tested without any I/O.

use super::client::FeedClient;
use crate::config::RuntimeSettings;
use crate::error::TransportError;
use rand::{Rng, rng};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, instrument, warn};
use url::Url;

/// Delay before retry number `attempt` (1-based).
///
/// ```text
/// delay = min(base * 2^(attempt-1), max)
/// ```
///
/// `attempt == 0` means "no retry yet" and yields zero.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// How many times and how patiently a channel fetch is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: settings.retry_base_delay,
            max_delay: settings.retry_max_delay,
            jitter: settings.retry_jitter,
        }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    fn sleep_for(&self, attempt: u32) -> Duration {
        let delay = backoff_delay(attempt, self.base_delay, self.max_delay);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rng().random_range(0..=jitter_ms))
    }
}

/// Wrapper that adds exponential backoff retry logic to any [`FeedClient`].
pub struct RetryClient<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> RetryClient<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The undecorated client, for single-shot requests.
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T> fmt::Debug for RetryClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryClient")
            .field("policy", &self.policy)
            .finish()
    }
}

impl<T: FeedClient> FeedClient for RetryClient<T> {
    /// Returns the first success, or the last error once
    /// `max_retries + 1` attempts have failed.
    #[instrument(level = "debug", skip_all, fields(%url))]
    async fn get_text(&self, url: &Url) -> Result<String, TransportError> {
        let total_t0 = Instant::now();
        let mut attempt = 0u32;

        loop {
            match self.inner.get_text(url).await {
                Ok(body) => {
                    if attempt > 0 {
                        warn!(%url, retries = attempt, "Fetch succeeded after retries");
                    }
                    return Ok(body);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.policy.max_retries {
                        error!(
                            %url,
                            attempts = attempt,
                            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                            error = %e,
                            "Fetch exhausted retries"
                        );
                        return Err(e);
                    }

                    let delay = self.policy.sleep_for(attempt);
                    warn!(
                        %url,
                        attempt,
                        max = self.policy.max_retries,
                        ?delay,
                        error = %e,
                        "Fetch attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
