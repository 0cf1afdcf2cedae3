//! Quote Cache Port (Driven Port)
//!
//! Latest-quote store keyed by `quote:{provider}:{symbol}`.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::streaming::CanonicalQuote;

/// Cache failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The backing store is unreachable.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// The value could not be encoded.
    #[error("cache encoding failed: {0}")]
    Encoding(String),
}

/// Cache key for a provider's latest quote on a symbol.
#[must_use]
pub fn quote_cache_key(provider: &str, symbol: &str) -> String {
    format!("quote:{provider}:{symbol}")
}

/// Port for the latest-quote cache.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuoteCache: Send + Sync {
    /// Store a quote under `key` for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the store fails.
    async fn store(&self, key: &str, quote: &CanonicalQuote, ttl: Duration)
    -> Result<(), CacheError>;

    /// Fetch a live quote.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the store fails.
    async fn get(&self, key: &str) -> Result<Option<CanonicalQuote>, CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format() {
        assert_eq!(quote_cache_key("alpaca", "AAPL"), "quote:alpaca:AAPL");
    }
}
