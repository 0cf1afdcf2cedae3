//! Upstream Wire Codec
//!
//! JSON framing used by the upstream quote feeds. Servers send arrays of
//! objects tagged by `T`:
//!
//! ```json
//! [{"T":"success","msg":"connected"}]
//! [{"T":"error","code":402,"msg":"auth failed"}]
//! [{"T":"subscription","quotes":["AAPL"]}]
//! [{"T":"q","S":"AAPL","bp":189.1,"ap":189.2,"t":"2024-03-15T14:30:00Z"}]
//! ```
//!
//! Requests are single objects keyed by `action`; subscription requests
//! name the channel for the capability (`quotes`, `trades`, `bars`).

use serde_json::{Map, Value, json};

use crate::domain::streaming::{CapabilityType, Symbol};
use crate::infrastructure::config::Credentials;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Well-formed JSON with an unexpected shape.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// One decoded upstream message.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    /// Control acknowledgement (`connected`, `authenticated`).
    Success(String),
    /// Server-reported error.
    Error {
        /// Provider error code.
        code: i32,
        /// Provider message.
        message: String,
    },
    /// Current subscription set echoed by the server.
    Subscription(Value),
    /// Market data for one symbol.
    Data {
        /// Message tag (`q`, `t`, `b`).
        kind: String,
        /// Symbol from `S`.
        symbol: Symbol,
        /// Full message object.
        payload: Value,
    },
    /// Anything else (status, corrections, ...).
    Other(String),
}

/// Subscription request direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    /// Add symbols.
    Subscribe,
    /// Remove symbols.
    Unsubscribe,
}

impl SubscriptionAction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Request channel for a capability.
#[must_use]
pub const fn channel_for(capability: CapabilityType) -> &'static str {
    match capability {
        CapabilityType::Quotes | CapabilityType::OptionQuotes => "quotes",
        CapabilityType::Trades | CapabilityType::OptionTrades => "trades",
        CapabilityType::Bars => "bars",
    }
}

/// Data tag carried by messages for a capability.
#[must_use]
pub const fn data_kind_for(capability: CapabilityType) -> &'static str {
    match capability {
        CapabilityType::Quotes | CapabilityType::OptionQuotes => "q",
        CapabilityType::Trades | CapabilityType::OptionTrades => "t",
        CapabilityType::Bars => "b",
    }
}

/// Decode a text message into frames.
///
/// # Errors
///
/// Returns an error for invalid JSON or a top level that is neither an
/// object nor an array of objects.
pub fn decode(text: &str) -> Result<Vec<UpstreamFrame>, CodecError> {
    match serde_json::from_str::<Value>(text.trim())? {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(decode_object(map)),
                other => Err(CodecError::InvalidFormat(format!(
                    "expected object in array, got {other}"
                ))),
            })
            .collect(),
        Value::Object(map) => Ok(vec![decode_object(map)]),
        other => Err(CodecError::InvalidFormat(format!(
            "expected object or array, got {other}"
        ))),
    }
}

fn decode_object(map: Map<String, Value>) -> UpstreamFrame {
    let tag = map.get("T").and_then(Value::as_str).unwrap_or_default().to_string();
    match tag.as_str() {
        "success" => UpstreamFrame::Success(str_field(&map, "msg")),
        "error" => UpstreamFrame::Error {
            code: map
                .get("code")
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok())
                .unwrap_or_default(),
            message: str_field(&map, "msg"),
        },
        "subscription" => UpstreamFrame::Subscription(Value::Object(map)),
        _ => match map.get("S").and_then(Value::as_str) {
            Some(symbol) if !symbol.is_empty() => UpstreamFrame::Data {
                kind: tag,
                symbol: symbol.to_uppercase(),
                payload: Value::Object(map),
            },
            _ => UpstreamFrame::Other(tag),
        },
    }
}

fn str_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Authentication request.
#[must_use]
pub fn encode_auth(credentials: &Credentials) -> String {
    json!({
        "action": "auth",
        "key": credentials.api_key(),
        "secret": credentials.api_secret(),
    })
    .to_string()
}

/// Subscribe or unsubscribe request for one capability's channel.
#[must_use]
pub fn encode_subscription(
    action: SubscriptionAction,
    capability: CapabilityType,
    symbols: &[Symbol],
) -> String {
    let mut request = Map::new();
    request.insert("action".to_string(), Value::from(action.as_str()));
    request.insert(channel_for(capability).to_string(), Value::from(symbols.to_vec()));
    Value::Object(request).to_string()
}
