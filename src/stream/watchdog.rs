//! Inactivity watchdog for the notification stream.
//!
//! The watchdog has no callback. Its owner awaits [`InactivityWatchdog::expired`]
//! inside its own `select!` loop, so expiry is handled on the same task as
//! event processing and the timer state has a single writer.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

/// Silence tolerated before a stream is considered stalled.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Resettable single-shot timer.
#[derive(Debug)]
pub struct InactivityWatchdog {
    timeout: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
    deadline: Option<Instant>,
    last_reset: Option<Instant>,
}

impl InactivityWatchdog {
    /// Creates a disarmed watchdog.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: None,
            deadline: None,
            last_reset: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts a new arm cycle expiring `timeout` from now.
    pub fn arm(&mut self) {
        self.restart();
    }

    /// Postpones expiry to `timeout` from now.
    ///
    /// Starts the timer if it is not running.
    pub fn reset(&mut self) {
        self.restart();
    }

    /// Cancels the pending expiry without rescheduling.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Instant at which the current arm cycle expires.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Instant of the most recent arm or reset.
    pub fn last_reset(&self) -> Option<Instant> {
        self.last_reset
    }

    /// Completes when the armed deadline passes, then disarms.
    ///
    /// Never completes while disarmed. Cancel safe: dropping the future
    /// leaves the timer untouched.
    pub async fn expired(&mut self) {
        match (self.deadline, self.sleep.as_mut()) {
            (Some(_), Some(sleep)) => {
                sleep.as_mut().await;
                self.deadline = None;
            }
            _ => std::future::pending().await,
        }
    }

    fn restart(&mut self) {
        let now = Instant::now();
        let deadline = now + self.timeout;
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
        self.deadline = Some(deadline);
        self.last_reset = Some(now);
    }
}

impl Default for InactivityWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_INACTIVITY_TIMEOUT)
    }
}
