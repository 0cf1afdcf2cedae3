//! In-Memory Quote Cache
//!
//! Latest-quote store with per-entry TTL. Expired entries are invisible to
//! readers immediately and removed by [`InMemoryQuoteCache::cleanup_expired`]
//! or when overwritten.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::application::ports::{CacheError, QuoteCache};
use crate::domain::streaming::CanonicalQuote;

#[derive(Debug, Clone)]
struct CacheEntry {
    quote: CanonicalQuote,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// TTL map keyed by `quote:{provider}:{symbol}`.
#[derive(Debug, Default)]
pub struct InMemoryQuoteCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryQuoteCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Entries held, including expired ones not yet cleaned up.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl QuoteCache for InMemoryQuoteCache {
    async fn store(
        &self,
        key: &str,
        quote: &CanonicalQuote,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| CacheError::Encoding(format!("ttl {ttl:?} out of range")))?;
        self.entries.write().insert(
            key.to_string(),
            CacheEntry {
                quote: quote.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CanonicalQuote>, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.quote.clone()))
    }
}
