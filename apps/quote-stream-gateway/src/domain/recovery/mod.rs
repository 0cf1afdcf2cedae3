//! Recovery Domain
//!
//! Replay requests and the short-lived window of recently broadcast frames
//! they are served from. The window is bounded by both retention age and
//! frame count; it is not a durable log.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::streaming::{CapabilityType, ClientId, DataFrame, FeedKey, Symbol};

// =============================================================================
// Request
// =============================================================================

/// Why a client asked for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryReason {
    /// Client reconnected after a drop.
    Reconnect,
    /// Client detected a sequence gap.
    Gap,
    /// Operator or user initiated.
    Manual,
}

impl RecoveryReason {
    /// Label value for metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reconnect => "reconnect",
            Self::Gap => "gap",
            Self::Manual => "manual",
        }
    }
}

/// Rejected recovery request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryError {
    /// The requested start is older than the recovery window.
    #[error("requested data is {age_ms}ms old, recovery window is {window_ms}ms")]
    WindowExceeded {
        /// Age of the requested start.
        age_ms: i64,
        /// Configured window.
        window_ms: i64,
    },

    /// The requested start is in the future.
    #[error("recovery timestamp is in the future")]
    FutureTimestamp,

    /// No symbols were named.
    #[error("recovery requires at least one symbol")]
    NoSymbols,

    /// The timestamp cannot be represented.
    #[error("invalid recovery timestamp: {0}")]
    InvalidTimestamp(i64),

    /// The client does not hold these symbols.
    #[error("not subscribed to {}", .0.join(", "))]
    NotSubscribed(Vec<Symbol>),

    /// The client's credentials do not cover the feed.
    #[error("not permitted to replay {0}")]
    NotPermitted(CapabilityType),
}

/// A replay request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    /// Requesting client.
    pub client_id: ClientId,
    /// Symbols to replay.
    pub symbols: Vec<Symbol>,
    /// Replay frames at or after this time.
    pub since: DateTime<Utc>,
    /// Why replay was requested.
    pub reason: RecoveryReason,
}

impl RecoveryRequest {
    /// Build a request from an epoch-millisecond timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::InvalidTimestamp`] when out of range.
    pub fn from_millis(
        client_id: ClientId,
        symbols: Vec<Symbol>,
        since_ms: i64,
        reason: RecoveryReason,
    ) -> Result<Self, RecoveryError> {
        let since = DateTime::<Utc>::from_timestamp_millis(since_ms)
            .ok_or(RecoveryError::InvalidTimestamp(since_ms))?;
        Ok(Self {
            client_id,
            symbols,
            since,
            reason,
        })
    }

    /// Check the request against the window as of `now`.
    ///
    /// # Errors
    ///
    /// Returns a [`RecoveryError`] when the request cannot be served.
    pub fn validate(&self, now: DateTime<Utc>, window: Duration) -> Result<(), RecoveryError> {
        if self.symbols.is_empty() {
            return Err(RecoveryError::NoSymbols);
        }
        if self.since > now {
            return Err(RecoveryError::FutureTimestamp);
        }

        let age_ms = (now - self.since).num_milliseconds();
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        if age_ms > window_ms {
            return Err(RecoveryError::WindowExceeded { age_ms, window_ms });
        }
        Ok(())
    }
}

// =============================================================================
// Replay Window
// =============================================================================

/// Recently broadcast frames, oldest first.
#[derive(Debug)]
pub struct ReplayWindow {
    frames: VecDeque<DataFrame>,
    retention: chrono::Duration,
    max_frames: usize,
}

impl ReplayWindow {
    /// Create an empty window.
    #[must_use]
    pub fn new(retention: Duration, max_frames: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
            max_frames,
        }
    }

    /// Record a live frame.
    pub fn record(&mut self, frame: DataFrame, now: DateTime<Utc>) {
        if self.max_frames == 0 {
            return;
        }
        self.frames.push_back(frame);
        while self.frames.len() > self.max_frames {
            self.frames.pop_front();
        }
        self.prune(now);
    }

    /// Drop frames past retention.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return;
        };
        while self
            .frames
            .front()
            .is_some_and(|frame| frame.timestamp < cutoff)
        {
            self.frames.pop_front();
        }
    }

    /// Replay copies of `feed` frames for `symbols` at or after `since`.
    #[must_use]
    pub fn frames_since(
        &self,
        feed: &FeedKey,
        symbols: &HashSet<Symbol>,
        since: DateTime<Utc>,
    ) -> Vec<DataFrame> {
        self.frames
            .iter()
            .filter(|frame| {
                frame.timestamp >= since
                    && frame.provider == feed.provider
                    && frame.capability == feed.capability
                    && frame.symbols.iter().any(|s| symbols.contains(s))
            })
            .map(DataFrame::as_replay)
            .collect()
    }

    /// Frames held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the window is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
