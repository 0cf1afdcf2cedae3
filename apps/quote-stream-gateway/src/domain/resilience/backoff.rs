//! Exponential Backoff
//!
//! Delay schedule shared by batch retries and upstream reconnects:
//! `initial × multiplier^attempt`, capped at `max_delay`, with optional
//! symmetric jitter.

use std::time::Duration;

use rand::Rng;

/// Configuration for an exponential backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Maximum number of delays handed out (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(64),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

impl BackoffConfig {
    /// Deterministic `base × 2^attempt` schedule used for batch retries.
    #[must_use]
    pub const fn batch_retry(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: base_delay,
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    /// Un-jittered delay for the given zero-based attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let base = self.initial_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = base * self.multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let cap = self.max_delay.as_millis() as f64;

        let millis = if scaled.is_finite() {
            scaled.clamp(0.0, cap)
        } else {
            cap
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let rounded = millis.round() as u64;
        Duration::from_millis(rounded)
    }
}

/// Stateful iterator over a backoff schedule.
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    attempt_count: u32,
}

impl BackoffPolicy {
    /// Create a new policy at attempt zero.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Next delay, or `None` once `max_attempts` delays have been handed out.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        let delay = self.config.delay_for(self.attempt_count);
        self.attempt_count += 1;
        Some(self.apply_jitter(delay))
    }

    /// Reset after a success.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Delays handed out so far.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another delay is available.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }

        #[allow(clippy::cast_precision_loss)]
        let base = delay.as_millis() as f64;
        let spread = base * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-spread..=spread);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted = (base + jitter).max(1.0) as u64;
        Duration::from_millis(adjusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(initial_ms: u64, max_ms: u64, max_attempts: u32) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn doubles_each_attempt() {
        let mut policy = BackoffPolicy::new(fixed(100, 10_000, 0));

        let delays: Vec<_> = (0..4).filter_map(|_| policy.next_delay()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn caps_at_max_delay() {
        let config = fixed(1_000, 2_000, 0);
        assert_eq!(config.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(config.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(config.delay_for(40), Duration::from_millis(2_000));
    }

    #[test]
    fn stops_after_max_attempts() {
        let mut policy = BackoffPolicy::new(BackoffConfig::batch_retry(
            Duration::from_millis(10),
            2,
        ));

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());

        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let mut policy = BackoffPolicy::new(BackoffConfig {
                initial_delay: Duration::from_millis(1_000),
                jitter_factor: 0.1,
                ..BackoffConfig::default()
            });
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1_100).contains(&millis), "delay {millis}ms out of range");
        }
    }
}
