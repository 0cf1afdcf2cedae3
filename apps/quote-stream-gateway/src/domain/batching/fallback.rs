//! Batch Fallback
//!
//! What happens to a batch the transform path could not handle: classify it,
//! pick a small subset worth salvaging, and push that subset through a
//! minimal path that reads prices straight out of the raw payload.
//!
//! Large batches are never fully reprocessed here; an outage upstream of the
//! transform collaborator should not be amplified by replaying everything.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::domain::streaming::{DataFrame, FeedKey, QuoteEvent, Symbol};

// =============================================================================
// Policy
// =============================================================================

/// Subset selection policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackPolicy {
    /// Symbols always salvaged first.
    pub priority_symbols: HashSet<Symbol>,
    /// Subset size when no priority symbol is present, and the cap on
    /// priority events for oversized batches.
    pub partial_recovery_limit: usize,
    /// Batches with more events than this are oversized.
    pub full_reprocess_limit: usize,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            priority_symbols: HashSet::new(),
            partial_recovery_limit: 5,
            full_reprocess_limit: 100,
        }
    }
}

impl FallbackPolicy {
    fn is_priority(&self, event: &QuoteEvent) -> bool {
        event
            .symbols
            .iter()
            .any(|symbol| self.priority_symbols.contains(symbol))
    }
}

/// Why a batch was routed to fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackReason {
    /// The breaker refused the attempt.
    CircuitOpen,
    /// Every attempt failed.
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the last attempt.
        last_error: String,
    },
}

impl FallbackReason {
    /// Label value for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Shape of a failed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchClassification {
    /// Events in the batch.
    pub event_count: usize,
    /// Distinct symbols touched.
    pub symbol_count: usize,
    /// Distinct (provider, capability) feeds.
    pub distinct_markets: usize,
    /// Mean event age at classification time.
    pub average_age_ms: u64,
    /// Whether the batch exceeds the full-reprocess limit.
    pub oversized: bool,
}

/// Classify `events` as of `now`.
#[must_use]
pub fn classify(
    events: &[QuoteEvent],
    now: Instant,
    policy: &FallbackPolicy,
) -> BatchClassification {
    let symbols: HashSet<&str> = events
        .iter()
        .flat_map(|event| event.symbols.iter().map(String::as_str))
        .collect();
    let feeds: HashSet<FeedKey> = events.iter().map(QuoteEvent::feed).collect();

    let total_age: u128 = events
        .iter()
        .map(|event| now.saturating_duration_since(event.received_instant).as_millis())
        .sum();
    let count = u128::try_from(events.len()).unwrap_or(u128::MAX);
    let average_age_ms = if count == 0 {
        0
    } else {
        u64::try_from(total_age / count).unwrap_or(u64::MAX)
    };

    BatchClassification {
        event_count: events.len(),
        symbol_count: symbols.len(),
        distinct_markets: feeds.len(),
        average_age_ms,
        oversized: events.len() > policy.full_reprocess_limit,
    }
}

/// Events chosen for partial recovery.
#[derive(Debug)]
pub struct RecoverySelection<'a> {
    /// Chosen events, in batch order.
    pub events: Vec<&'a QuoteEvent>,
    /// Whether selection was driven by priority symbols.
    pub by_priority: bool,
}

/// Pick the subset to push through the minimal path.
///
/// Priority-symbol events win; an oversized batch caps them at the partial
/// recovery limit. Without priority events, the first events up to the limit
/// are taken.
#[must_use]
pub fn select_recovery_subset<'a>(
    events: &'a [QuoteEvent],
    classification: &BatchClassification,
    policy: &FallbackPolicy,
) -> RecoverySelection<'a> {
    let priority: Vec<&QuoteEvent> = events.iter().filter(|e| policy.is_priority(e)).collect();

    if priority.is_empty() {
        return RecoverySelection {
            events: events.iter().take(policy.partial_recovery_limit).collect(),
            by_priority: false,
        };
    }

    let cap = if classification.oversized {
        policy.partial_recovery_limit
    } else {
        priority.len()
    };
    RecoverySelection {
        events: priority.into_iter().take(cap).collect(),
        by_priority: true,
    }
}

// =============================================================================
// Minimal Path
// =============================================================================

/// Why the minimal path could not build a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MinimalPathError {
    /// The payload is not a JSON object.
    #[error("payload is not an object")]
    NotAnObject,

    /// No recognizable price field.
    #[error("no price fields in payload")]
    NoPriceFields,

    /// The event names no symbols.
    #[error("event has no symbols")]
    NoSymbols,
}

/// Prices read directly from a raw payload.
///
/// Serializes prices as JSON numbers, matching live payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MinimalQuote {
    /// Best bid.
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub bid: Option<Decimal>,
    /// Best ask.
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub ask: Option<Decimal>,
    /// Last price.
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub last: Option<Decimal>,
}

impl MinimalQuote {
    /// Read price fields from a provider payload.
    ///
    /// Accepts long names (`bid`, `ask`, `price`, `last`) and the short
    /// names common in provider feeds (`bp`, `ap`, `p`).
    ///
    /// # Errors
    ///
    /// Returns [`MinimalPathError`] when the payload carries no price.
    pub fn extract(payload: &Value) -> Result<Self, MinimalPathError> {
        let object = payload.as_object().ok_or(MinimalPathError::NotAnObject)?;

        let quote = Self {
            bid: first_decimal(object, &["bid", "bp", "bid_price"]),
            ask: first_decimal(object, &["ask", "ap", "ask_price"]),
            last: first_decimal(object, &["last", "price", "p"]),
        };

        if quote.bid.is_none() && quote.ask.is_none() && quote.last.is_none() {
            return Err(MinimalPathError::NoPriceFields);
        }
        Ok(quote)
    }
}

fn first_decimal(object: &Map<String, Value>, keys: &[&str]) -> Option<Decimal> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find_map(decimal_from_json)
}

fn decimal_from_json(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => Decimal::from_str(&number.to_string()).ok(),
        Value::String(text) => Decimal::from_str(text.trim()).ok(),
        _ => None,
    }
}

/// Build degraded frames for one event, one per symbol.
///
/// # Errors
///
/// Returns [`MinimalPathError`] when prices cannot be read.
pub fn minimal_frames(event: &QuoteEvent) -> Result<Vec<DataFrame>, MinimalPathError> {
    if event.symbols.is_empty() {
        return Err(MinimalPathError::NoSymbols);
    }
    let quote = MinimalQuote::extract(&event.raw_payload)?;
    let prices = serde_json::to_value(&quote).map_err(|_| MinimalPathError::NoPriceFields)?;

    Ok(event
        .symbols
        .iter()
        .map(|symbol| {
            let mut payload = Map::new();
            payload.insert("symbol".to_string(), Value::String(symbol.clone()));
            if let Value::Object(fields) = &prices {
                payload.extend(fields.clone());
            }
            DataFrame {
                symbols: vec![symbol.clone()],
                provider: event.provider.clone(),
                capability: event.capability,
                payload: Value::Object(payload),
                timestamp: event.received_at,
                replay: false,
                degraded: true,
            }
        })
        .collect())
}

// =============================================================================
// Diagnostic
// =============================================================================

/// Emitted once per batch routed to fallback.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackDiagnostic {
    /// Batch id.
    pub batch_id: u64,
    /// Why the batch fell back.
    pub reason: FallbackReason,
    /// Batch shape.
    pub classification: BatchClassification,
    /// Events attempted on the minimal path.
    pub attempted: usize,
    /// Events that produced frames.
    pub recovered: usize,
    /// Events the minimal path rejected.
    pub failed: usize,
    /// Whether the subset came from priority symbols.
    pub by_priority: bool,
    /// When the diagnostic was produced.
    pub at: DateTime<Utc>,
}
