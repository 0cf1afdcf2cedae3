//! Client Wire Protocol
//!
//! JSON text frames tagged by `type`. Field names are camelCase and every
//! timestamp is epoch milliseconds.

use serde::{Deserialize, Serialize};

use crate::application::error::ErrorKind;
use crate::domain::batching::BatchStats;
use crate::domain::recovery::RecoveryReason;
use crate::domain::resilience::CircuitState;
use crate::domain::streaming::{CapabilityType, ClientId, DataFrame, Symbol};
use crate::domain::subscription::SubscriptionSnapshot;

// =============================================================================
// Client -> Server
// =============================================================================

/// Message sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Subscribe to symbols on one feed.
    Subscribe {
        /// Requested symbols.
        symbols: Vec<String>,
        /// Feed type wire name, e.g. `quotes`.
        capability_type: String,
        /// Provider; the configured default when absent.
        #[serde(default)]
        provider: Option<String>,
    },
    /// Drop some or all symbols.
    Unsubscribe {
        /// Symbols to drop; all when absent.
        #[serde(default)]
        symbols: Option<Vec<String>>,
    },
    /// Application-level ping.
    Ping,
    /// Replay frames since a timestamp.
    RequestRecovery {
        /// Symbols to replay.
        symbols: Vec<String>,
        /// Last frame time the client saw.
        last_receive_timestamp: i64,
        /// Why the client is asking.
        #[serde(default)]
        reason: Option<RecoveryReason>,
    },
    /// Current subscription.
    GetSubscription,
    /// Server and pipeline status.
    GetInfo,
}

impl ClientMessage {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns the serde error for malformed JSON or an unknown `type`.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// =============================================================================
// Server -> Client
// =============================================================================

/// Message sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First frame after the upgrade.
    Connected {
        /// Id assigned to the connection.
        client_id: ClientId,
        /// Server time.
        timestamp: i64,
    },
    /// Subscribe succeeded.
    SubscribeAck {
        /// Symbols the client now holds from this request.
        symbols: Vec<Symbol>,
        /// Feed type.
        capability_type: CapabilityType,
        /// Server time.
        timestamp: i64,
    },
    /// Subscribe failed; nothing changed.
    SubscribeError {
        /// Reason.
        message: String,
        /// Error category.
        code: ErrorKind,
        /// Symbols as requested.
        symbols: Vec<String>,
        /// Server time.
        timestamp: i64,
    },
    /// Market data.
    Data {
        /// Symbols the payload covers.
        symbols: Vec<Symbol>,
        /// Originating provider.
        provider: String,
        /// Feed type.
        capability_type: CapabilityType,
        /// Canonical payload.
        payload: serde_json::Value,
        /// Event time.
        timestamp: i64,
        /// Replayed by recovery.
        replay: bool,
        /// Bypassed the transform.
        degraded: bool,
    },
    /// Unsubscribe done.
    UnsubscribeAck {
        /// Symbols removed.
        symbols: Vec<Symbol>,
        /// Server time.
        timestamp: i64,
    },
    /// Unsubscribe could not be applied.
    UnsubscribeError {
        /// Reason.
        message: String,
        /// Server time.
        timestamp: i64,
    },
    /// Reply to `ping`.
    Pong {
        /// Server time.
        timestamp: i64,
    },
    /// Recovery accepted; data frames follow.
    RecoveryStarted {
        /// Symbols being replayed.
        symbols: Vec<Symbol>,
        /// Frames expected.
        estimated_volume: usize,
        /// Server time.
        timestamp: i64,
    },
    /// Recovery rejected.
    RecoveryError {
        /// Error category.
        code: ErrorKind,
        /// Reason.
        message: String,
        /// Server time.
        timestamp: i64,
    },
    /// Reply to `getSubscription`.
    Subscription {
        /// Held symbols, sorted.
        symbols: Vec<Symbol>,
        /// Feed type, absent without a subscription.
        capability_type: Option<CapabilityType>,
        /// Provider, absent without a subscription.
        provider: Option<String>,
        /// Creation time.
        subscribed_at: Option<i64>,
        /// Last inbound activity.
        last_active_at: Option<i64>,
    },
    /// Reply to `getInfo`.
    Info {
        /// The caller's id.
        client_id: ClientId,
        /// Server version.
        version: String,
        /// Clients holding subscriptions.
        connected_clients: usize,
        /// Current batch interval.
        batch_interval_ms: u64,
        /// Batch breaker state.
        circuit_state: CircuitState,
        /// Pipeline counters.
        stats: BatchStats,
        /// Server time.
        timestamp: i64,
    },
    /// Malformed or unexpected frame.
    Error {
        /// Error category.
        code: ErrorKind,
        /// Reason.
        message: String,
        /// Server time.
        timestamp: i64,
    },
}

impl ServerMessage {
    /// `data` frame for a broadcast or replayed frame.
    #[must_use]
    pub fn data(frame: &DataFrame) -> Self {
        Self::Data {
            symbols: frame.symbols.clone(),
            provider: frame.provider.clone(),
            capability_type: frame.capability,
            payload: frame.payload.clone(),
            timestamp: frame.timestamp.timestamp_millis(),
            replay: frame.replay,
            degraded: frame.degraded,
        }
    }

    /// `subscription` reply; empty when the client holds nothing.
    #[must_use]
    pub fn subscription(snapshot: Option<SubscriptionSnapshot>) -> Self {
        match snapshot {
            Some(s) => Self::Subscription {
                symbols: s.symbols,
                capability_type: Some(s.capability_type),
                provider: Some(s.provider),
                subscribed_at: Some(s.subscribed_at.timestamp_millis()),
                last_active_at: Some(s.last_active_at.timestamp_millis()),
            },
            None => Self::Subscription {
                symbols: Vec::new(),
                capability_type: None,
                provider: None,
                subscribed_at: None,
                last_active_at: None,
            },
        }
    }

    /// Encode as a text frame body.
    ///
    /// # Errors
    ///
    /// Returns the serde error if the payload cannot be encoded.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Current time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
