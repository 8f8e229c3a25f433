//! Reconnect backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic and are used by the
//! stream supervisor to pace reconnect attempts after failed connects.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::error::Elapsed;
use tracing::debug;

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_JITTER: Duration = Duration::from_millis(250);

/// Policy controlling the delay between consecutive failed connect attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl BackoffPolicy {
    /// Retries immediately with no delay at all.
    pub fn immediate() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Computes the delay to apply after the given failed attempt.
    ///
    /// `attempt` is 1-based and counts consecutive failures since the last
    /// successful connect.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + self.jitter_for(attempt)
    }

    /// Pseudo-random extra delay in `0..=jitter`, seeded from the wall clock.
    fn jitter_for(&self, attempt: usize) -> Duration {
        let bound = u64::try_from(self.jitter.as_nanos()).unwrap_or(u64::MAX);
        if bound == 0 {
            return Duration::ZERO;
        }

        let clock = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| u64::from(since.subsec_nanos()))
            .unwrap_or_default();
        let seed = clock ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        Duration::from_nanos(seed % bound.saturating_add(1))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter: DEFAULT_JITTER,
        }
    }
}

/// Sleeps for the backoff delay of a failed attempt.
pub(crate) async fn backoff_sleep(policy: &BackoffPolicy, attempt: usize) {
    let delay = policy.delay_for_attempt(attempt);
    debug!(
        event = "reconnect_backoff",
        attempt,
        delay_ms = delay.as_millis() as u64
    );
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Bounds `future` by `limit`.
pub async fn with_timeout<F>(limit: Duration, future: F) -> Result<F::Output, Elapsed>
where
    F: Future,
{
    tokio::time::timeout(limit, future).await
}
