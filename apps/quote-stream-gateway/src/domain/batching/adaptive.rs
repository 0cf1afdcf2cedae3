//! Adaptive Batch Interval
//!
//! Tunes the flush interval from observed load. Load is sampled once per
//! adjustment period as batches flushed per second; the mean of a sliding
//! sample window is compared against the high/low thresholds.
//!
//! High load shortens the interval (fresher frames, smaller batches), low
//! load lengthens it. The interval never leaves `[min_interval, max_interval]`.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Shortest interval the controller hands out; timers reject zero periods.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Tuning parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveBatchingConfig {
    /// Whether tuning runs at all.
    pub enabled: bool,
    /// Interval at startup.
    pub initial_interval: Duration,
    /// Lower bound.
    pub min_interval: Duration,
    /// Upper bound.
    pub max_interval: Duration,
    /// Mean load (batches/s) above which the interval shrinks.
    pub high_load_threshold: f64,
    /// Mean load (batches/s) below which the interval grows.
    pub low_load_threshold: f64,
    /// Change per adjustment.
    pub step: Duration,
    /// How often a sample is taken and evaluated.
    pub adjustment_period: Duration,
    /// Samples kept in the sliding window.
    pub sample_window: usize,
}

impl Default for AdaptiveBatchingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_interval: Duration::from_millis(50),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(500),
            high_load_threshold: 15.0,
            low_load_threshold: 2.0,
            step: Duration::from_millis(10),
            adjustment_period: Duration::from_secs(5),
            sample_window: 12,
        }
    }
}

/// Which way an adjustment moved the interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentDirection {
    /// Interval shortened under high load.
    Decrease,
    /// Interval lengthened under low load.
    Increase,
}

impl AdjustmentDirection {
    /// Label value for metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Decrease => "decrease",
            Self::Increase => "increase",
        }
    }
}

/// An interval change decided by the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalAdjustment {
    /// Interval before.
    pub from: Duration,
    /// Interval after.
    pub to: Duration,
    /// Mean load that triggered it.
    pub mean_load: f64,
    /// Direction of the change.
    pub direction: AdjustmentDirection,
}

/// Observable tuning state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicBatchingState {
    /// Whether tuning is enabled.
    pub enabled: bool,
    /// Current flush interval.
    pub current_interval_ms: u64,
    /// When the interval last changed.
    pub last_adjustment_at: Option<DateTime<Utc>>,
    /// Number of interval changes so far.
    pub adjustment_count: u64,
    /// Recent load samples, oldest first.
    pub sliding_load_samples: VecDeque<f64>,
}

/// Interval controller.
#[derive(Debug)]
pub struct AdaptiveController {
    config: AdaptiveBatchingConfig,
    current: Duration,
    state: DynamicBatchingState,
}

impl AdaptiveController {
    /// Create a controller. Bounds given in the wrong order are swapped,
    /// no bound or period goes below [`MIN_FLUSH_INTERVAL`], and the initial
    /// interval is clamped into the bounds.
    #[must_use]
    pub fn new(mut config: AdaptiveBatchingConfig) -> Self {
        if config.min_interval > config.max_interval {
            std::mem::swap(&mut config.min_interval, &mut config.max_interval);
        }
        config.min_interval = config.min_interval.max(MIN_FLUSH_INTERVAL);
        config.max_interval = config.max_interval.max(MIN_FLUSH_INTERVAL);
        config.adjustment_period = config.adjustment_period.max(MIN_FLUSH_INTERVAL);
        config.sample_window = config.sample_window.max(1);

        let current = config
            .initial_interval
            .clamp(config.min_interval, config.max_interval);

        let state = DynamicBatchingState {
            enabled: config.enabled,
            current_interval_ms: duration_millis(current),
            last_adjustment_at: None,
            adjustment_count: 0,
            sliding_load_samples: VecDeque::with_capacity(config.sample_window),
        };

        Self {
            config,
            current,
            state,
        }
    }

    /// Interval the collector should flush on.
    #[must_use]
    pub const fn current_interval(&self) -> Duration {
        self.current
    }

    /// How often the collector should sample load.
    #[must_use]
    pub const fn adjustment_period(&self) -> Duration {
        self.config.adjustment_period
    }

    /// Whether tuning is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Snapshot of the tuning state.
    #[must_use]
    pub fn state(&self) -> DynamicBatchingState {
        self.state.clone()
    }

    /// Record a load sample and decide whether the interval changes.
    pub fn observe(&mut self, load: f64) -> Option<IntervalAdjustment> {
        if !self.config.enabled {
            return None;
        }
        if load.is_finite() {
            self.state.sliding_load_samples.push_back(load.max(0.0));
            while self.state.sliding_load_samples.len() > self.config.sample_window {
                self.state.sliding_load_samples.pop_front();
            }
        }
        self.evaluate()
    }

    fn evaluate(&mut self) -> Option<IntervalAdjustment> {
        let samples = &self.state.sliding_load_samples;
        if samples.is_empty() {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let mean_load = samples.iter().sum::<f64>() / samples.len() as f64;

        let (target, direction) = if mean_load > self.config.high_load_threshold {
            (
                self.current
                    .saturating_sub(self.config.step)
                    .max(self.config.min_interval),
                AdjustmentDirection::Decrease,
            )
        } else if mean_load < self.config.low_load_threshold {
            (
                (self.current + self.config.step).min(self.config.max_interval),
                AdjustmentDirection::Increase,
            )
        } else {
            return None;
        };

        if target == self.current {
            return None;
        }

        let adjustment = IntervalAdjustment {
            from: self.current,
            to: target,
            mean_load,
            direction,
        };
        self.current = target;
        self.state.current_interval_ms = duration_millis(target);
        self.state.last_adjustment_at = Some(Utc::now());
        self.state.adjustment_count += 1;
        Some(adjustment)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
