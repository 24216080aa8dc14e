//! Bounded exponential backoff for remote subscribe and data-get retries.

use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before the timer reports that all attempts failed.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Ceiling on the delay, and the period of the slow retry that
    /// continues after all attempts failed.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration with the default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: 2.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay after `attempt` failures (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(6)
    }
}

/// Tracks the retry schedule of one remote operation.
///
/// Failures push the next permitted attempt out exponentially; once
/// `max_attempts` have failed the timer reports exhaustion and degrades to
/// a slow periodic retry at `max_delay` — a synchronizer stays pending and
/// keeps trying rather than giving up for good.
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    config: RetryConfig,
    failures: u32,
    due_at: Option<u64>,
}

impl BackoffTimer {
    /// Creates an idle timer.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
            due_at: None,
        }
    }

    /// Records a failure at `now`, scheduling the next permitted attempt.
    pub fn notify_failure(&mut self, now: u64) {
        self.failures = self.failures.saturating_add(1);
        let delay = if self.exhausted() {
            self.config.max_delay
        } else {
            self.config.delay_for_attempt(self.failures)
        };
        self.due_at = Some(now + delay.as_secs().max(1));
    }

    /// Records a success, resetting the schedule.
    pub fn notify_success(&mut self) {
        self.failures = 0;
        self.due_at = None;
    }

    /// True while a scheduled delay has not yet elapsed.
    pub fn blocks(&self, now: u64) -> bool {
        matches!(self.due_at, Some(due) if now < due)
    }

    /// True once `max_attempts` consecutive failures were recorded.
    pub fn exhausted(&self) -> bool {
        self.failures >= self.config.max_attempts
    }

    /// Number of consecutive failures recorded.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
