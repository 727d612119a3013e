//! Retry policy with exponential backoff.
//!
//! One reusable policy object applied uniformly at the producer gateway
//! and consumer runner boundaries, instead of ad-hoc inline retry loops.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::RetrySettings;

/// Retry policy: attempt cap plus backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts for bounded retries.
    pub max_attempts: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Backoff duration cap.
    pub max_backoff: Duration,
    /// Multiplier for exponential growth.
    pub multiplier: f64,
    /// Jitter factor as a fraction (0.2 = ±20%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Build a policy from configuration.
    #[must_use]
    pub const fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff: settings.initial_backoff,
            max_backoff: settings.max_backoff,
            multiplier: settings.multiplier,
            jitter_factor: settings.jitter_factor,
        }
    }

    /// Start a fresh backoff sequence under this policy.
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        Backoff {
            attempt: 0,
            max_attempts: self.max_attempts,
            initial_backoff_ms: self.initial_backoff.as_millis() as u64,
            max_backoff_ms: self.max_backoff.as_millis() as u64,
            multiplier: self.multiplier,
            jitter_factor: self.jitter_factor,
        }
    }
}

/// Stateful backoff calculator for one retry sequence.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
}

impl Backoff {
    /// Next delay with jitter, or `None` once the attempt cap is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }

        let base_ms = self.base_delay_ms();
        let jittered_ms = self.apply_jitter(base_ms).min(self.max_backoff_ms);
        self.attempt += 1;

        Some(Duration::from_millis(jittered_ms))
    }

    /// Next delay with jitter, growing without an attempt cap.
    ///
    /// Used where abandoning work would silently lose a state update; the
    /// delay still caps at the configured maximum.
    pub fn next_delay_uncapped(&mut self) -> Duration {
        let base_ms = self.base_delay_ms();
        let jittered_ms = self.apply_jitter(base_ms).min(self.max_backoff_ms);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(jittered_ms)
    }

    /// Attempts consumed so far.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset the sequence after a success.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    fn base_delay_ms(&self) -> u64 {
        let multiplier = self.multiplier.powi(self.attempt.min(63) as i32);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let delay = (self.initial_backoff_ms as f64 * multiplier) as u64;
        delay.min(self.max_backoff_ms)
    }

    fn apply_jitter(&self, delay_ms: u64) -> u64 {
        if self.jitter_factor <= 0.0 {
            return delay_ms;
        }

        #[allow(clippy::cast_precision_loss)]
        let jitter_range = delay_ms as f64 * self.jitter_factor;
        let min = (delay_ms as f64 - jitter_range).max(0.0);
        let max = delay_ms as f64 + jitter_range;

        let mut rng = rand::rng();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let jittered = rng.random_range(min..=max) as u64;
        jittered
    }
}
