//! Passthrough Transformer
//!
//! Minimal [`QuoteTransformer`] that emits one canonical quote per symbol
//! per event, carrying the provider payload through unchanged apart from a
//! `rules` field naming the selector applied. An RFC 3339 `t` field in the
//! payload becomes the quote timestamp; otherwise the receive time is used.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::application::ports::{QuoteTransformer, TransformError};
use crate::domain::streaming::{CanonicalQuote, QuoteEvent};

/// Identity transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTransformer;

impl PassthroughTransformer {
    /// Create a transformer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QuoteTransformer for PassthroughTransformer {
    async fn transform(
        &self,
        rule_selector: &str,
        events: &[QuoteEvent],
    ) -> Result<Vec<CanonicalQuote>, TransformError> {
        let mut quotes = Vec::with_capacity(events.len());
        for event in events {
            let timestamp = event_time(&event.raw_payload).unwrap_or(event.received_at);
            let mut payload = event.raw_payload.clone();
            if let Value::Object(map) = &mut payload {
                map.insert("rules".to_string(), Value::String(rule_selector.to_string()));
            }

            quotes.extend(event.symbols.iter().map(|symbol| CanonicalQuote {
                symbol: symbol.clone(),
                provider: event.provider.clone(),
                capability: event.capability,
                payload: payload.clone(),
                timestamp,
            }));
        }
        Ok(quotes)
    }
}

fn event_time(payload: &Value) -> Option<DateTime<Utc>> {
    let raw = payload.get("t")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
