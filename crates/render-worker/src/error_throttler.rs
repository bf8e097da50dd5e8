// ErrorThrottler: capped exponential backoff for transient manager failures.
// The delay starts at a base value, doubles after every failure up to a
// ceiling, and returns to the base on the next success.

use render_common::WorkerSettings;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Multiplier for exponential growth.
const BACKOFF_MULTIPLIER: u32 = 2;

/// Capped exponential backoff state.
#[derive(Debug, Clone)]
pub struct ErrorThrottler {
    base: Duration,
    ceiling: Duration,
    current_delay: Duration,
    failures: u32,
}

impl ErrorThrottler {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(base);
        Self {
            base,
            ceiling,
            current_delay: base,
            failures: 0,
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self::new(settings.backoff_base(), settings.backoff_ceiling())
    }

    /// Return to the base delay after a success.
    pub fn reset(&mut self) {
        self.current_delay = self.base;
        self.failures = 0;
    }

    /// The delay the next failure will wait.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.failures = self.failures.saturating_add(1);
        self.current_delay = delay
            .checked_mul(BACKOFF_MULTIPLIER)
            .unwrap_or(self.ceiling)
            .min(self.ceiling);
        delay
    }

    /// Record a failure and sleep for the resulting delay.
    ///
    /// Returns `true` if the delay completed normally, `false` if cancelled.
    pub async fn increment_and_wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();

        tracing::warn!(
            "Backing off for {:.1}s after {} consecutive failure(s)",
            delay.as_secs_f64(),
            self.failures
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}
