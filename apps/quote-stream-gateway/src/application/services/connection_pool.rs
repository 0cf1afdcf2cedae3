//! Connection Pool
//!
//! One upstream capability per (provider, capability) pair, shared by every
//! client that needs it. Concurrent acquires for the same feed share a
//! single open; a failed open leaves nothing behind so the next acquire
//! tries again.
//!
//! The pool keeps its own accounting of which symbols each capability has
//! been asked for, and releases a capability once that set drains.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{OnceCell, mpsc};

use crate::application::ports::{
    CapabilityConnector, CapabilityStatus, UpstreamCapability, UpstreamError,
};
use crate::domain::streaming::{FeedKey, QuoteEvent, Symbol};
use crate::infrastructure::metrics::{self, PoolOutcome};

/// Shared capability handle.
pub type CapabilityRef = Arc<dyn UpstreamCapability>;

/// Pool timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Hard limit on waiting for a new capability to become ready.
    pub acquire_timeout: Duration,
    /// Readiness poll interval.
    pub poll_interval: Duration,
    /// Per-handle liveness probe limit.
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

struct PoolEntry {
    cell: Arc<OnceCell<CapabilityRef>>,
    symbols: HashSet<Symbol>,
}

impl PoolEntry {
    fn new() -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            symbols: HashSet::new(),
        }
    }
}

/// Pool of upstream capabilities.
pub struct ConnectionPool {
    connector: Arc<dyn CapabilityConnector>,
    events: mpsc::Sender<QuoteEvent>,
    config: PoolConfig,
    entries: Mutex<HashMap<FeedKey, PoolEntry>>,
}

impl ConnectionPool {
    /// Create a pool that forwards capability events into `events`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn CapabilityConnector>,
        events: mpsc::Sender<QuoteEvent>,
        config: PoolConfig,
    ) -> Self {
        Self {
            connector,
            events,
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the capability for `feed`, opening it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] if the capability cannot be opened or does
    /// not become ready within the acquire timeout.
    pub async fn acquire(&self, feed: &FeedKey) -> Result<CapabilityRef, UpstreamError> {
        let cell = {
            let mut entries = self.entries.lock();
            Arc::clone(&entries.entry(feed.clone()).or_insert_with(PoolEntry::new).cell)
        };

        if let Some(capability) = cell.get() {
            metrics::record_pool_acquisition(feed, PoolOutcome::Reused);
            return Ok(Arc::clone(capability));
        }

        match cell.get_or_try_init(|| self.open(feed)).await {
            Ok(capability) => Ok(Arc::clone(capability)),
            Err(e) => {
                self.forget_unopened(feed, &cell);
                Err(e)
            }
        }
    }

    /// Subscribe symbols on `feed`, retrying once on failure.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] if acquisition fails or both attempts fail.
    pub async fn subscribe_symbols(
        &self,
        feed: &FeedKey,
        symbols: &[Symbol],
    ) -> Result<(), UpstreamError> {
        if symbols.is_empty() {
            return Ok(());
        }
        let capability = self.acquire(feed).await?;
        retry_once("subscribe", feed, || capability.subscribe(symbols)).await?;

        if let Some(entry) = self.entries.lock().get_mut(feed) {
            entry.symbols.extend(symbols.iter().cloned());
        }
        tracing::debug!(%feed, count = symbols.len(), "Upstream symbols added");
        Ok(())
    }

    /// Unsubscribe symbols on `feed`, retrying once on failure. Releases the
    /// capability once no symbols remain.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] if both attempts fail. Accounting is
    /// updated regardless.
    pub async fn unsubscribe_symbols(
        &self,
        feed: &FeedKey,
        symbols: &[Symbol],
    ) -> Result<(), UpstreamError> {
        if symbols.is_empty() {
            return Ok(());
        }
        let Some(capability) = self.opened(feed) else {
            return Ok(());
        };

        let result = retry_once("unsubscribe", feed, || capability.unsubscribe(symbols)).await;

        let drained = self.entries.lock().get_mut(feed).is_some_and(|entry| {
            for symbol in symbols {
                entry.symbols.remove(symbol);
            }
            entry.symbols.is_empty()
        });
        if drained {
            self.release(feed).await;
        }
        result
    }

    /// Release `feed` if the pool holds no symbols for it.
    pub async fn release_if_idle(&self, feed: &FeedKey) {
        let idle = self
            .entries
            .lock()
            .get(feed)
            .is_some_and(|entry| entry.symbols.is_empty());
        if idle {
            self.release(feed).await;
        }
    }

    /// Drop bookkeeping for `feed` and close its capability. Close errors
    /// are logged.
    pub async fn release(&self, feed: &FeedKey) {
        let entry = self.entries.lock().remove(feed);
        let Some(capability) = entry.and_then(|entry| entry.cell.get().cloned()) else {
            return;
        };

        match capability.close().await {
            Ok(()) => tracing::info!(%feed, "Upstream capability released"),
            Err(e) => tracing::warn!(%feed, error = %e, "Upstream capability close failed"),
        }
    }

    /// Close every capability.
    pub async fn close_all(&self) {
        let feeds: Vec<FeedKey> = self.entries.lock().keys().cloned().collect();
        for feed in feeds {
            self.release(&feed).await;
        }
    }

    /// Probe every open capability, each bounded by the probe timeout.
    ///
    /// Keys are `provider/capability`.
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        let handles: Vec<(FeedKey, CapabilityRef)> = self
            .entries
            .lock()
            .iter()
            .filter_map(|(feed, entry)| entry.cell.get().map(|c| (feed.clone(), Arc::clone(c))))
            .collect();

        let timeout = self.config.probe_timeout;
        let probes = handles.into_iter().map(|(feed, capability)| async move {
            let alive = matches!(
                tokio::time::timeout(timeout, capability.ping()).await,
                Ok(Ok(()))
            );
            (feed.to_string(), alive)
        });

        join_all(probes).await.into_iter().collect()
    }

    /// Readiness of every open capability, without probing.
    ///
    /// Keys are `provider/capability`.
    #[must_use]
    pub fn readiness(&self) -> BTreeMap<String, bool> {
        self.entries
            .lock()
            .iter()
            .filter_map(|(feed, entry)| {
                entry
                    .cell
                    .get()
                    .map(|capability| (feed.to_string(), capability.is_ready()))
            })
            .collect()
    }

    /// Feeds with an open capability, sorted.
    #[must_use]
    pub fn open_feeds(&self) -> Vec<FeedKey> {
        let mut feeds: Vec<FeedKey> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.cell.initialized())
            .map(|(feed, _)| feed.clone())
            .collect();
        feeds.sort();
        feeds
    }

    /// Symbols the pool has subscribed on `feed`, sorted.
    #[must_use]
    pub fn symbols_for(&self, feed: &FeedKey) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self
            .entries
            .lock()
            .get(feed)
            .map(|entry| entry.symbols.iter().cloned().collect())
            .unwrap_or_default();
        symbols.sort_unstable();
        symbols
    }

    fn opened(&self, feed: &FeedKey) -> Option<CapabilityRef> {
        self.entries
            .lock()
            .get(feed)
            .and_then(|entry| entry.cell.get().cloned())
    }

    fn forget_unopened(&self, feed: &FeedKey, cell: &Arc<OnceCell<CapabilityRef>>) {
        let mut entries = self.entries.lock();
        if entries
            .get(feed)
            .is_some_and(|entry| Arc::ptr_eq(&entry.cell, cell) && !entry.cell.initialized())
        {
            entries.remove(feed);
        }
    }

    async fn open(&self, feed: &FeedKey) -> Result<CapabilityRef, UpstreamError> {
        tracing::info!(%feed, "Opening upstream capability");

        let capability = match self.connector.open(feed, self.events.clone()).await {
            Ok(capability) => capability,
            Err(e) => {
                metrics::record_pool_acquisition(feed, PoolOutcome::Failed);
                tracing::error!(%feed, error = %e, "Failed to open upstream capability");
                return Err(e);
            }
        };
        register_callbacks(feed, capability.as_ref());

        let ready = tokio::time::timeout(
            self.config.acquire_timeout,
            wait_until_ready(capability.as_ref(), self.config.poll_interval),
        )
        .await;

        if ready.is_err() {
            metrics::record_pool_acquisition(feed, PoolOutcome::Failed);
            tracing::error!(
                %feed,
                timeout_ms = u64::try_from(self.config.acquire_timeout.as_millis()).unwrap_or(u64::MAX),
                "Upstream capability never became ready"
            );
            if let Err(e) = capability.close().await {
                tracing::warn!(%feed, error = %e, "Close after failed open also failed");
            }
            return Err(UpstreamError::ReadyTimeout(self.config.acquire_timeout));
        }

        metrics::record_pool_acquisition(feed, PoolOutcome::Opened);
        tracing::info!(%feed, "Upstream capability ready");
        Ok(capability)
    }
}

fn register_callbacks(feed: &FeedKey, capability: &dyn UpstreamCapability) {
    let status_feed = feed.clone();
    capability.on_status_change(Box::new(move |status| {
        tracing::info!(feed = %status_feed, %status, "Upstream status changed");
        if status == CapabilityStatus::Reconnecting {
            metrics::record_upstream_reconnect(&status_feed.provider);
        }
    }));

    let error_feed = feed.clone();
    capability.on_error(Box::new(move |error| {
        tracing::warn!(feed = %error_feed, %error, "Upstream error");
        metrics::record_upstream_error(&error_feed.provider, "stream");
    }));
}

async fn wait_until_ready(capability: &dyn UpstreamCapability, poll_interval: Duration) {
    while !capability.is_ready() {
        tokio::time::sleep(poll_interval).await;
    }
}

async fn retry_once<F, Fut>(
    operation: &str,
    feed: &FeedKey,
    mut call: F,
) -> Result<(), UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), UpstreamError>>,
{
    match call().await {
        Ok(()) => Ok(()),
        Err(first) => {
            tracing::warn!(%feed, operation, error = %first, "Upstream request failed, retrying once");
            metrics::record_upstream_error(&feed.provider, operation);
            call().await
        }
    }
}
