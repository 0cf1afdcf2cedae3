//! Heartbeat Tracking
//!
//! Liveness bookkeeping for one upstream session. The session loop calls
//! [`Heartbeat::on_tick`] on every ping interval and feeds inbound traffic
//! to [`Heartbeat::record_activity`]; any inbound frame counts as a pong.

use std::time::{Duration, Instant};

use crate::infrastructure::config::WebSocketSettings;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// Silence after a ping before the connection is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(20),
        }
    }
}

impl HeartbeatConfig {
    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub const fn from_websocket_settings(settings: &WebSocketSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }
}

/// What the session should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping frame.
    SendPing,
    /// No traffic since the last ping for longer than the timeout.
    TimedOut {
        /// Time since the last inbound frame.
        silent_for: Duration,
    },
}

/// Per-connection heartbeat state.
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    last_activity: Instant,
    ping_sent_at: Option<Instant>,
}

impl Heartbeat {
    /// Fresh state for a new connection.
    #[must_use]
    pub const fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            last_activity: now,
            ping_sent_at: None,
        }
    }

    /// Ping interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.config.ping_interval
    }

    /// Record inbound traffic.
    pub const fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
        self.ping_sent_at = None;
    }

    /// Whether a ping is outstanding.
    #[must_use]
    pub const fn is_waiting_for_pong(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// Decide the tick's action and update state.
    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        if let Some(sent_at) = self.ping_sent_at
            && now.saturating_duration_since(sent_at) > self.config.pong_timeout
        {
            return HeartbeatAction::TimedOut {
                silent_for: now.saturating_duration_since(self.last_activity),
            };
        }
        if self.ping_sent_at.is_none() {
            self.ping_sent_at = Some(now);
        }
        HeartbeatAction::SendPing
    }
}
