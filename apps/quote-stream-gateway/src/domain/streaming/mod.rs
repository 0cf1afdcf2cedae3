//! Market Quote Streaming Types
//!
//! Core domain types that flow through the pipeline: raw [`QuoteEvent`]s
//! from upstream capabilities, [`CanonicalQuote`]s produced by the transform
//! collaborator, and the [`DataFrame`]s fanned out to clients.
//!
//! These types are transport-agnostic. The gateway maps [`DataFrame`] onto
//! its wire protocol; upstream adapters build [`QuoteEvent`]s from whatever
//! their provider speaks.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a connected client.
pub type ClientId = u64;

/// A symbol string (stock ticker or OCC option symbol).
pub type Symbol = String;

/// Name of an upstream market data provider (e.g. `alpaca`).
pub type ProviderName = String;

/// Generate a fresh client identifier.
#[must_use]
pub fn next_client_id() -> ClientId {
    uuid::Uuid::new_v4().as_u64_pair().0
}

// =============================================================================
// Capability Type
// =============================================================================

/// Upstream feed type offered by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    /// Top-of-book quotes.
    Quotes,
    /// Last-sale trades.
    Trades,
    /// OHLCV bars.
    Bars,
    /// Option quotes.
    OptionQuotes,
    /// Option trades.
    OptionTrades,
}

impl CapabilityType {
    /// Get all capability types.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Quotes,
            Self::Trades,
            Self::Bars,
            Self::OptionQuotes,
            Self::OptionTrades,
        ]
    }

    /// Wire name of this capability.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quotes => "quotes",
            Self::Trades => "trades",
            Self::Bars => "bars",
            Self::OptionQuotes => "option_quotes",
            Self::OptionTrades => "option_trades",
        }
    }

    /// Parse a capability from its wire name (case-insensitive).
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        let lowered = s.trim().to_lowercase();
        Self::all()
            .iter()
            .copied()
            .find(|capability| capability.as_str() == lowered)
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Feed Key
// =============================================================================

/// A (provider, capability) pair identifying one upstream feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedKey {
    /// Upstream provider.
    pub provider: ProviderName,
    /// Feed type.
    pub capability: CapabilityType,
}

impl FeedKey {
    /// Create a new feed key.
    #[must_use]
    pub fn new(provider: impl Into<ProviderName>, capability: CapabilityType) -> Self {
        Self {
            provider: provider.into(),
            capability,
        }
    }

    /// Rule selector handed to the transform collaborator for this feed.
    #[must_use]
    pub fn rule_selector(&self) -> String {
        format!("{}.{}", self.provider, self.capability)
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.capability)
    }
}

// =============================================================================
// Quote Event
// =============================================================================

/// A raw event received from an upstream capability.
///
/// Immutable once built; the batch processor consumes each event exactly once.
#[derive(Debug, Clone)]
pub struct QuoteEvent {
    /// Provider that produced the event.
    pub provider: ProviderName,
    /// Feed type the event belongs to.
    pub capability: CapabilityType,
    /// Symbols touched by the event.
    pub symbols: Vec<Symbol>,
    /// Provider payload, untouched.
    pub raw_payload: serde_json::Value,
    /// Wall-clock receive time.
    pub received_at: DateTime<Utc>,
    /// Monotonic receive time, used for event age.
    pub received_instant: Instant,
}

impl QuoteEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(
        provider: impl Into<ProviderName>,
        capability: CapabilityType,
        symbols: Vec<Symbol>,
        raw_payload: serde_json::Value,
    ) -> Self {
        Self {
            provider: provider.into(),
            capability,
            symbols,
            raw_payload,
            received_at: Utc::now(),
            received_instant: Instant::now(),
        }
    }

    /// Feed this event belongs to.
    #[must_use]
    pub fn feed(&self) -> FeedKey {
        FeedKey::new(self.provider.clone(), self.capability)
    }
}

// =============================================================================
// Canonical Quote
// =============================================================================

/// A quote in canonical schema, as returned by the transform collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalQuote {
    /// Symbol this quote is for.
    pub symbol: Symbol,
    /// Provider the quote originated from.
    pub provider: ProviderName,
    /// Feed type.
    pub capability: CapabilityType,
    /// Canonical payload.
    pub payload: serde_json::Value,
    /// Event time.
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Data Frame
// =============================================================================

/// The unit of fan-out: one payload for one or more symbols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    /// Symbols this frame carries data for.
    pub symbols: Vec<Symbol>,
    /// Originating provider.
    pub provider: ProviderName,
    /// Feed type.
    pub capability: CapabilityType,
    /// Frame payload.
    pub payload: serde_json::Value,
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Whether this frame is being replayed by the recovery worker.
    pub replay: bool,
    /// Whether this frame bypassed the transform collaborator.
    pub degraded: bool,
}

impl DataFrame {
    /// Build a live frame from a canonical quote.
    #[must_use]
    pub fn from_canonical(quote: &CanonicalQuote) -> Self {
        Self {
            symbols: vec![quote.symbol.clone()],
            provider: quote.provider.clone(),
            capability: quote.capability,
            payload: quote.payload.clone(),
            timestamp: quote.timestamp,
            replay: false,
            degraded: false,
        }
    }

    /// Copy of this frame tagged for replay.
    #[must_use]
    pub fn as_replay(&self) -> Self {
        Self {
            replay: true,
            ..self.clone()
        }
    }

    /// Whether the frame carries data for `symbol`.
    #[must_use]
    pub fn contains_symbol(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| s == symbol)
    }
}

// =============================================================================
// Tests
// =============================================================================
