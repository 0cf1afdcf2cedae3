//! Subscription Registry
//!
//! Source of truth for which client wants which symbols.
//!
//! # Design
//!
//! The registry tracks:
//! - Which symbols each client is subscribed to (client → symbols)
//! - Which clients hold each symbol (symbol → clients)
//! - Reference counts per upstream feed, so shared symbols keep a single
//!   upstream subscription
//!
//! All three indexes live behind one lock, so every mutation is atomic with
//! respect to the others and the client/symbol indexes always mirror each
//! other.

mod sink;

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

pub use sink::{DeliveryError, FrameSink, SharedSink};

use crate::domain::streaming::{CapabilityType, ClientId, DataFrame, FeedKey, Symbol};

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes to upstream subscriptions for one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Feed the changes apply to.
    pub feed: FeedKey,
    /// Symbols to subscribe to upstream.
    pub subscribe: HashSet<Symbol>,
    /// Symbols to unsubscribe from upstream.
    pub unsubscribe: HashSet<Symbol>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Create changes with only subscribes.
    #[must_use]
    pub fn subscribe_only(feed: FeedKey, symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            feed,
            subscribe: symbols.into_iter().collect(),
            unsubscribe: HashSet::new(),
        }
    }

    /// Create changes with only unsubscribes.
    #[must_use]
    pub fn unsubscribe_only(feed: FeedKey, symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            feed,
            subscribe: HashSet::new(),
            unsubscribe: symbols.into_iter().collect(),
        }
    }
}

/// Result of adding symbols for a client.
#[derive(Debug, Clone)]
pub struct AddOutcome {
    /// Symbols newly added for this client (already-held symbols excluded).
    pub added: Vec<Symbol>,
    /// Upstream changes required by the addition.
    pub changes: SubscriptionChanges,
}

/// A client removed by the idle sweep.
pub struct EvictedClient {
    /// The evicted client.
    pub client_id: ClientId,
    /// Upstream changes required by the eviction.
    pub changes: SubscriptionChanges,
    /// The client's sink, so the caller can close the connection.
    pub sink: SharedSink,
}

impl std::fmt::Debug for EvictedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictedClient")
            .field("client_id", &self.client_id)
            .field("changes", &self.changes)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Registry mutation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The client already holds symbols on a different feed.
    #[error("client is subscribed to {current}; unsubscribe before switching to {requested}")]
    FeedMismatch {
        /// Feed the client currently holds.
        current: FeedKey,
        /// Feed that was requested.
        requested: FeedKey,
    },
}

// =============================================================================
// Client Subscription
// =============================================================================

/// One client's subscription, owned by the registry.
struct ClientSubscription {
    symbols: HashSet<Symbol>,
    feed: FeedKey,
    subscribed_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    last_active: Instant,
    sink: SharedSink,
}

impl ClientSubscription {
    fn touch(&mut self) {
        self.last_active_at = Utc::now();
        self.last_active = Instant::now();
    }
}

/// Read-only view of a client's subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSnapshot {
    /// Subscribed symbols, sorted.
    pub symbols: Vec<Symbol>,
    /// Feed type.
    pub capability_type: CapabilityType,
    /// Provider.
    pub provider: String,
    /// When the subscription was created.
    pub subscribed_at: DateTime<Utc>,
    /// Last inbound activity from the client.
    pub last_active_at: DateTime<Utc>,
}

// =============================================================================
// Broadcast Report
// =============================================================================

/// Outcome of fanning one frame out to a symbol's subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Frames accepted by sinks.
    pub delivered: usize,
    /// Frames dropped by full client queues.
    pub dropped: usize,
    /// Clients whose sink failed or panicked.
    pub failed: Vec<ClientId>,
}

impl BroadcastReport {
    /// Merge another report into this one.
    pub fn merge(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.dropped += other.dropped;
        self.failed.extend(other.failed);
    }

    /// Number of sinks attempted.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered + self.dropped + self.failed.len()
    }
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Default)]
struct RegistryState {
    clients: HashMap<ClientId, ClientSubscription>,
    symbol_clients: HashMap<Symbol, HashSet<ClientId>>,
    feed_refcount: HashMap<FeedKey, HashMap<Symbol, usize>>,
}

impl RegistryState {
    fn add(
        &mut self,
        client_id: ClientId,
        symbols: &[Symbol],
        feed: FeedKey,
        sink: SharedSink,
    ) -> Result<AddOutcome, RegistryError> {
        if let Some(existing) = self.clients.get(&client_id)
            && existing.feed != feed
            && !existing.symbols.is_empty()
        {
            return Err(RegistryError::FeedMismatch {
                current: existing.feed.clone(),
                requested: feed,
            });
        }

        let client = self.clients.entry(client_id).or_insert_with(|| {
            let now = Utc::now();
            ClientSubscription {
                symbols: HashSet::new(),
                feed: feed.clone(),
                subscribed_at: now,
                last_active_at: now,
                last_active: Instant::now(),
                sink: sink.clone(),
            }
        });
        client.sink = sink;
        client.touch();

        let refcounts = self.feed_refcount.entry(feed.clone()).or_default();
        let mut added = Vec::new();
        let mut new_upstream = Vec::new();

        for symbol in symbols {
            if !client.symbols.insert(symbol.clone()) {
                continue;
            }
            added.push(symbol.clone());

            self.symbol_clients
                .entry(symbol.clone())
                .or_default()
                .insert(client_id);

            let refcount = refcounts.entry(symbol.clone()).or_insert(0);
            *refcount += 1;
            if *refcount == 1 {
                new_upstream.push(symbol.clone());
            }
        }

        if client.symbols.is_empty() {
            self.clients.remove(&client_id);
        }
        if refcounts.is_empty() {
            self.feed_refcount.remove(&feed);
        }

        Ok(AddOutcome {
            added,
            changes: SubscriptionChanges::subscribe_only(feed, new_upstream),
        })
    }

    /// Remove symbols (or everything) for a client.
    ///
    /// Returns the client's feed and sink alongside the upstream changes,
    /// or `None` for an unknown client.
    fn remove(
        &mut self,
        client_id: ClientId,
        symbols: Option<&[Symbol]>,
    ) -> Option<(SubscriptionChanges, SharedSink)> {
        let client = self.clients.get_mut(&client_id)?;
        let feed = client.feed.clone();
        let sink = client.sink.clone();

        let targets: Vec<Symbol> = match symbols {
            Some(symbols) => symbols
                .iter()
                .filter(|s| client.symbols.remove(*s))
                .cloned()
                .collect(),
            None => client.symbols.drain().collect(),
        };

        if client.symbols.is_empty() {
            self.clients.remove(&client_id);
        }

        let mut remove_upstream = Vec::new();
        for symbol in targets {
            if let Some(holders) = self.symbol_clients.get_mut(&symbol) {
                holders.remove(&client_id);
                if holders.is_empty() {
                    self.symbol_clients.remove(&symbol);
                }
            }

            if let Some(refcounts) = self.feed_refcount.get_mut(&feed)
                && let Some(refcount) = refcounts.get_mut(&symbol)
            {
                *refcount = refcount.saturating_sub(1);
                if *refcount == 0 {
                    refcounts.remove(&symbol);
                    remove_upstream.push(symbol);
                }
            }
        }

        if self
            .feed_refcount
            .get(&feed)
            .is_some_and(HashMap::is_empty)
        {
            self.feed_refcount.remove(&feed);
        }

        Some((
            SubscriptionChanges::unsubscribe_only(feed, remove_upstream),
            sink,
        ))
    }

    fn is_consistent(&self) -> bool {
        let forward = self.clients.iter().all(|(client_id, client)| {
            client.symbols.iter().all(|symbol| {
                self.symbol_clients
                    .get(symbol)
                    .is_some_and(|holders| holders.contains(client_id))
            })
        });

        let backward = self.symbol_clients.iter().all(|(symbol, holders)| {
            !holders.is_empty()
                && holders.iter().all(|client_id| {
                    self.clients
                        .get(client_id)
                        .is_some_and(|client| client.symbols.contains(symbol))
                })
        });

        forward && backward
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe registry of client subscriptions.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use quote_stream_gateway::domain::streaming::{CapabilityType, DataFrame, FeedKey};
/// use quote_stream_gateway::domain::subscription::{
///     DeliveryError, SharedSink, SubscriptionRegistry,
/// };
///
/// let registry = SubscriptionRegistry::new();
/// let feed = FeedKey::new("alpaca", CapabilityType::Quotes);
/// let sink: SharedSink = Arc::new(|_: &DataFrame| Ok::<(), DeliveryError>(()));
///
/// // Client 1 subscribes to AAPL: upstream needs AAPL
/// let outcome = registry
///     .add_subscription(1, &["AAPL".to_string()], feed.clone(), sink.clone())
///     .unwrap();
/// assert!(outcome.changes.subscribe.contains("AAPL"));
///
/// // Client 2 also subscribes: no upstream change needed
/// let outcome = registry
///     .add_subscription(2, &["AAPL".to_string()], feed, sink)
///     .unwrap();
/// assert!(outcome.changes.subscribe.is_empty());
///
/// // Client 1 leaves: still held by client 2
/// let changes = registry.remove_subscription(1, None).unwrap();
/// assert!(changes.unsubscribe.is_empty());
///
/// // Client 2 leaves: upstream can drop AAPL
/// let changes = registry.remove_subscription(2, None).unwrap();
/// assert!(changes.unsubscribe.contains("AAPL"));
/// ```
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add symbols for a client on a feed.
    ///
    /// Idempotent per symbol: symbols the client already holds are skipped.
    /// The sink replaces any previously registered one.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::FeedMismatch`] if the client already holds
    /// symbols on a different feed.
    pub fn add_subscription(
        &self,
        client_id: ClientId,
        symbols: &[Symbol],
        feed: FeedKey,
        sink: SharedSink,
    ) -> Result<AddOutcome, RegistryError> {
        self.state.write().add(client_id, symbols, feed, sink)
    }

    /// Remove symbols for a client; `None` removes everything.
    ///
    /// Returns `None` if the client holds no subscription.
    pub fn remove_subscription(
        &self,
        client_id: ClientId,
        symbols: Option<&[Symbol]>,
    ) -> Option<SubscriptionChanges> {
        self.state
            .write()
            .remove(client_id, symbols)
            .map(|(changes, _)| changes)
    }

    /// Whether any client still holds `symbol` on `feed`.
    #[must_use]
    pub fn is_required(&self, feed: &FeedKey, symbol: &str) -> bool {
        self.state
            .read()
            .feed_refcount
            .get(feed)
            .is_some_and(|refcounts| refcounts.contains_key(symbol))
    }

    /// Clients subscribed to a symbol, sorted.
    #[must_use]
    pub fn get_subscribers_for(&self, symbol: &str) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = self
            .state
            .read()
            .symbol_clients
            .get(symbol)
            .map(|holders| holders.iter().copied().collect())
            .unwrap_or_default();
        clients.sort_unstable();
        clients
    }

    /// Deduplicated, sorted symbols required upstream, optionally filtered
    /// by provider and capability.
    #[must_use]
    pub fn get_all_required_symbols(
        &self,
        provider: Option<&str>,
        capability: Option<CapabilityType>,
    ) -> Vec<Symbol> {
        let state = self.state.read();
        let mut symbols: Vec<Symbol> = state
            .feed_refcount
            .iter()
            .filter(|(feed, _)| provider.is_none_or(|p| feed.provider == p))
            .filter(|(feed, _)| capability.is_none_or(|c| feed.capability == c))
            .flat_map(|(_, refcounts)| refcounts.keys().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        drop(state);
        symbols.sort_unstable();
        symbols
    }

    /// Deliver a frame to every subscriber of `symbol` on the frame's feed.
    ///
    /// Clients bound to another provider or capability never see it. Each
    /// sink is isolated: an error or panic in one is logged and does
    /// not affect delivery to the rest. Sinks reporting a dead connection
    /// are asked to close.
    pub fn broadcast(&self, symbol: &str, frame: &DataFrame) -> BroadcastReport {
        let targets: Vec<(ClientId, SharedSink)> = {
            let state = self.state.read();
            let Some(holders) = state.symbol_clients.get(symbol) else {
                return BroadcastReport::default();
            };
            holders
                .iter()
                .filter_map(|id| state.clients.get(id).map(|c| (*id, c)))
                .filter(|(_, c)| {
                    c.feed.provider == frame.provider && c.feed.capability == frame.capability
                })
                .map(|(id, c)| (id, c.sink.clone()))
                .collect()
        };

        let mut report = BroadcastReport::default();
        for (client_id, sink) in targets {
            match catch_unwind(AssertUnwindSafe(|| sink.deliver(frame))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(DeliveryError::QueueFull)) => {
                    tracing::debug!(client_id, symbol, "Client queue full, frame dropped");
                    report.dropped += 1;
                }
                Ok(Err(e)) => {
                    tracing::warn!(client_id, symbol, error = %e, "Frame delivery failed");
                    if e.is_fatal() {
                        sink.close();
                    }
                    report.failed.push(client_id);
                }
                Err(_) => {
                    tracing::error!(client_id, symbol, "Frame sink panicked during broadcast");
                    report.failed.push(client_id);
                }
            }
        }
        report
    }

    /// Deliver a frame to a single client.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Disconnected`] for unknown clients, or the
    /// sink's own error.
    pub fn send_to(&self, client_id: ClientId, frame: &DataFrame) -> Result<(), DeliveryError> {
        let sink = self
            .state
            .read()
            .clients
            .get(&client_id)
            .map(|c| c.sink.clone())
            .ok_or(DeliveryError::Disconnected)?;

        catch_unwind(AssertUnwindSafe(|| sink.deliver(frame)))
            .unwrap_or_else(|_| Err(DeliveryError::Rejected("sink panicked".to_string())))
    }

    /// Record inbound activity for a client.
    ///
    /// Returns `false` if the client holds no subscription.
    pub fn touch(&self, client_id: ClientId) -> bool {
        self.state
            .write()
            .clients
            .get_mut(&client_id)
            .map(ClientSubscription::touch)
            .is_some()
    }

    /// Remove every client idle for longer than `idle_timeout` as of `now`.
    pub fn evict_idle(&self, now: Instant, idle_timeout: Duration) -> Vec<EvictedClient> {
        let mut state = self.state.write();

        let idle: Vec<ClientId> = state
            .clients
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_active) > idle_timeout)
            .map(|(id, _)| *id)
            .collect();

        idle.into_iter()
            .filter_map(|client_id| {
                state
                    .remove(client_id, None)
                    .map(|(changes, sink)| EvictedClient {
                        client_id,
                        changes,
                        sink,
                    })
            })
            .collect()
    }

    /// Snapshot of a client's subscription.
    #[must_use]
    pub fn get_subscription(&self, client_id: ClientId) -> Option<SubscriptionSnapshot> {
        let state = self.state.read();
        let client = state.clients.get(&client_id)?;
        let mut symbols: Vec<Symbol> = client.symbols.iter().cloned().collect();
        symbols.sort_unstable();
        Some(SubscriptionSnapshot {
            symbols,
            capability_type: client.feed.capability,
            provider: client.feed.provider.clone(),
            subscribed_at: client.subscribed_at,
            last_active_at: client.last_active_at,
        })
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        RegistryStats {
            client_count: state.clients.len(),
            symbol_count: state.symbol_clients.len(),
            feed_count: state.feed_refcount.len(),
        }
    }

    /// Verify the client and symbol indexes mirror each other.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.state.read().is_consistent()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Clients holding at least one symbol.
    pub client_count: usize,
    /// Distinct subscribed symbols.
    pub symbol_count: usize,
    /// Upstream feeds with at least one required symbol.
    pub feed_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    use super::*;

    fn feed() -> FeedKey {
        FeedKey::new("alpaca", CapabilityType::Quotes)
    }

    fn noop_sink() -> SharedSink {
        Arc::new(|_: &DataFrame| -> Result<(), DeliveryError> { Ok(()) })
    }

    fn counting_sink(counter: Arc<AtomicUsize>) -> SharedSink {
        Arc::new(move |_: &DataFrame| -> Result<(), DeliveryError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn symbols(list: &[&str]) -> Vec<Symbol> {
        list.iter().map(ToString::to_string).collect()
    }

    fn frame(symbol: &str) -> DataFrame {
        DataFrame {
            symbols: vec![symbol.to_string()],
            provider: "alpaca".to_string(),
            capability: CapabilityType::Quotes,
            payload: serde_json::json!({"bid": 1}),
            timestamp: Utc::now(),
            replay: false,
            degraded: false,
        }
    }

    #[test]
    fn add_subscription_new_symbol() {
        let registry = SubscriptionRegistry::new();

        let outcome = registry
            .add_subscription(1, &symbols(&["AAPL"]), feed(), noop_sink())
            .unwrap();

        assert!(outcome.changes.subscribe.contains("AAPL"));
        assert_eq!(outcome.added, symbols(&["AAPL"]));
        assert_eq!(registry.get_subscribers_for("AAPL"), vec![1]);
    }

    #[test]
    fn resubscribe_is_noop_success() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(1, &symbols(&["AAPL"]), feed(), noop_sink())
            .unwrap();

        let outcome = registry
            .add_subscription(1, &symbols(&["AAPL"]), feed(), noop_sink())
            .unwrap();

        assert!(outcome.added.is_empty());
        assert!(outcome.changes.is_empty());
        assert_eq!(registry.get_subscribers_for("AAPL"), vec![1]);
    }

    #[test]
    fn shared_symbol_needs_single_upstream_subscription() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(1, &symbols(&["AAPL"]), feed(), noop_sink())
            .unwrap();

        let outcome = registry
            .add_subscription(2, &symbols(&["AAPL"]), feed(), noop_sink())
            .unwrap();

        assert!(outcome.changes.subscribe.is_empty());
        assert_eq!(registry.get_subscribers_for("AAPL"), vec![1, 2]);
    }

    #[test]
    fn remove_last_holder_unsubscribes_upstream() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(1, &symbols(&["AAPL"]), feed(), noop_sink())
            .unwrap();
        registry
            .add_subscription(2, &symbols(&["AAPL"]), feed(), noop_sink())
            .unwrap();

        let changes = registry
            .remove_subscription(1, Some(&symbols(&["AAPL"])))
            .unwrap();
        assert!(changes.unsubscribe.is_empty());

        let changes = registry.remove_subscription(2, None).unwrap();
        assert!(changes.unsubscribe.contains("AAPL"));
        assert!(registry.get_subscribers_for("AAPL").is_empty());
    }

    #[test]
    fn remove_unknown_client_returns_none() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(1, &symbols(&["AAPL"]), feed(), noop_sink())
            .unwrap();

        assert!(registry.remove_subscription(2, None).is_none());
        assert_eq!(registry.stats().client_count, 1);
    }

    #[test]
    fn switching_feed_with_held_symbols_is_rejected() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(1, &symbols(&["AAPL"]), feed(), noop_sink())
            .unwrap();

        let trades = FeedKey::new("alpaca", CapabilityType::Trades);
        let err = registry
            .add_subscription(1, &symbols(&["MSFT"]), trades.clone(), noop_sink())
            .unwrap_err();

        assert_eq!(
            err,
            RegistryError::FeedMismatch {
                current: feed(),
                requested: trades,
            }
        );
        assert!(registry.get_subscribers_for("MSFT").is_empty());
    }

    #[test]
    fn required_symbols_filter_by_feed() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(1, &symbols(&["AAPL", "MSFT"]), feed(), noop_sink())
            .unwrap();
        registry
            .add_subscription(
                2,
                &symbols(&["SPY"]),
                FeedKey::new("polygon", CapabilityType::Trades),
                noop_sink(),
            )
            .unwrap();

        assert_eq!(
            registry.get_all_required_symbols(None, None),
            symbols(&["AAPL", "MSFT", "SPY"])
        );
        assert_eq!(
            registry.get_all_required_symbols(Some("alpaca"), None),
            symbols(&["AAPL", "MSFT"])
        );
        assert_eq!(
            registry.get_all_required_symbols(None, Some(CapabilityType::Trades)),
            symbols(&["SPY"])
        );
    }

    #[test]
    fn broadcast_isolates_failing_sink() {
        let registry = SubscriptionRegistry::new();
        let received = Arc::new(AtomicUsize::new(0));

        registry
            .add_subscription(
                1,
                &symbols(&["AAPL"]),
                feed(),
                counting_sink(received.clone()),
            )
            .unwrap();
        registry
            .add_subscription(
                2,
                &symbols(&["AAPL"]),
                feed(),
                Arc::new(|_: &DataFrame| -> Result<(), DeliveryError> {
                    Err(DeliveryError::Rejected("boom".to_string()))
                }),
            )
            .unwrap();
        registry
            .add_subscription(
                3,
                &symbols(&["AAPL"]),
                feed(),
                counting_sink(received.clone()),
            )
            .unwrap();

        let report = registry.broadcast("AAPL", &frame("AAPL"));

        assert_eq!(received.load(Ordering::SeqCst), 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec![2]);
    }

    #[test]
    fn broadcast_survives_panicking_sink() {
        let registry = SubscriptionRegistry::new();
        let received = Arc::new(AtomicUsize::new(0));

        registry
            .add_subscription(
                1,
                &symbols(&["AAPL"]),
                feed(),
                Arc::new(|_: &DataFrame| -> Result<(), DeliveryError> {
                    panic!("sink exploded")
                }),
            )
            .unwrap();
        registry
            .add_subscription(
                2,
                &symbols(&["AAPL"]),
                feed(),
                counting_sink(received.clone()),
            )
            .unwrap();

        let report = registry.broadcast("AAPL", &frame("AAPL"));

        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(report.failed, vec![1]);
        assert_eq!(report.attempted(), 2);
    }

    #[test]
    fn broadcast_counts_dropped_frames() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(
                1,
                &symbols(&["AAPL"]),
                feed(),
                Arc::new(|_: &DataFrame| -> Result<(), DeliveryError> {
                    Err(DeliveryError::QueueFull)
                }),
            )
            .unwrap();

        let report = registry.broadcast("AAPL", &frame("AAPL"));

        assert_eq!(report.dropped, 1);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn disconnected_client_not_targeted() {
        let registry = SubscriptionRegistry::new();
        let received = Arc::new(AtomicUsize::new(0));
        registry
            .add_subscription(
                1,
                &symbols(&["AAPL"]),
                feed(),
                counting_sink(received.clone()),
            )
            .unwrap();

        registry.remove_subscription(1, None);
        let report = registry.broadcast("AAPL", &frame("AAPL"));

        assert_eq!(report.attempted(), 0);
        assert_eq!(received.load(Ordering::SeqCst), 0);
        assert!(registry.get_subscribers_for("AAPL").is_empty());
    }

    #[test]
    fn broadcast_stays_on_the_frames_feed() {
        let registry = SubscriptionRegistry::new();
        let quotes = Arc::new(AtomicUsize::new(0));
        let trades = Arc::new(AtomicUsize::new(0));
        let polygon_trades = FeedKey::new("polygon", CapabilityType::Trades);
        registry
            .add_subscription(1, &symbols(&["AAPL"]), feed(), counting_sink(quotes.clone()))
            .unwrap();
        registry
            .add_subscription(
                2,
                &symbols(&["AAPL"]),
                polygon_trades.clone(),
                counting_sink(trades.clone()),
            )
            .unwrap();

        let trade = DataFrame {
            provider: "polygon".to_string(),
            capability: CapabilityType::Trades,
            ..frame("AAPL")
        };
        let report = registry.broadcast("AAPL", &trade);

        assert_eq!(report.attempted(), 1);
        assert_eq!(quotes.load(Ordering::SeqCst), 0);
        assert_eq!(trades.load(Ordering::SeqCst), 1);
        assert!(registry.is_required(&polygon_trades, "AAPL"));
        assert!(!registry.is_required(&polygon_trades, "MSFT"));
    }

    #[test]
    fn evict_idle_removes_stale_clients_only() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(1, &symbols(&["AAPL"]), feed(), noop_sink())
            .unwrap();
        registry
            .add_subscription(2, &symbols(&["AAPL", "MSFT"]), feed(), noop_sink())
            .unwrap();

        let later = Instant::now() + Duration::from_secs(600);
        let evicted = registry.evict_idle(later, Duration::from_secs(300));

        assert_eq!(evicted.len(), 2);
        assert_eq!(registry.stats(), RegistryStats::default());
        let released: HashSet<Symbol> = evicted
            .iter()
            .flat_map(|e| e.changes.unsubscribe.iter().cloned())
            .collect();
        assert_eq!(released, symbols(&["AAPL", "MSFT"]).into_iter().collect());
    }

    #[test]
    fn evict_idle_keeps_recent_clients() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(1, &symbols(&["AAPL"]), feed(), noop_sink())
            .unwrap();

        let evicted = registry.evict_idle(Instant::now(), Duration::from_secs(300));

        assert!(evicted.is_empty());
        assert!(registry.touch(1));
        assert!(!registry.touch(99));
    }

    #[test]
    fn send_to_unknown_client_is_disconnected() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(
            registry.send_to(42, &frame("AAPL")),
            Err(DeliveryError::Disconnected)
        );
    }

    #[test]
    fn subscription_snapshot_lists_sorted_symbols() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(7, &symbols(&["MSFT", "AAPL"]), feed(), noop_sink())
            .unwrap();

        let snapshot = registry.get_subscription(7).unwrap();

        assert_eq!(snapshot.symbols, symbols(&["AAPL", "MSFT"]));
        assert_eq!(snapshot.capability_type, CapabilityType::Quotes);
        assert_eq!(snapshot.provider, "alpaca");
        assert!(registry.get_subscription(8).is_none());
    }

    #[test]
    fn concurrent_mutations_stay_consistent() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handles: Vec<_> = (0..8u64)
            .map(|client| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for round in 0..100 {
                        let symbol = format!("SYM{}", (client + round) % 5);
                        registry
                            .add_subscription(
                                client,
                                std::slice::from_ref(&symbol),
                                feed(),
                                noop_sink(),
                            )
                            .unwrap();
                        if round % 3 == 0 {
                            registry.remove_subscription(client, Some(std::slice::from_ref(&symbol)));
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(registry.is_consistent());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(ClientId, Vec<usize>),
        Remove(ClientId, Option<Vec<usize>>),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let symbol_idx = prop::collection::vec(0usize..6, 0..4);
        prop_oneof![
            (0u64..4, symbol_idx.clone()).prop_map(|(c, s)| Op::Add(c, s)),
            (0u64..4, prop::option::of(symbol_idx)).prop_map(|(c, s)| Op::Remove(c, s)),
        ]
    }

    proptest! {
        #[test]
        fn indexes_stay_mirrored(ops in prop::collection::vec(op_strategy(), 0..60)) {
            const UNIVERSE: [&str; 6] = ["AAPL", "MSFT", "GOOG", "TSLA", "NVDA", "SPY"];
            let registry = SubscriptionRegistry::new();
            let pick = |idx: &[usize]| -> Vec<Symbol> {
                idx.iter().map(|i| UNIVERSE[*i].to_string()).collect()
            };

            for op in ops {
                match op {
                    Op::Add(client, idx) => {
                        registry.add_subscription(client, &pick(&idx), feed(), noop_sink()).unwrap();
                    }
                    Op::Remove(client, idx) => {
                        let selected = idx.map(|i| pick(&i));
                        registry.remove_subscription(client, selected.as_deref());
                    }
                }
                prop_assert!(registry.is_consistent());
            }

            for symbol in UNIVERSE {
                for client in registry.get_subscribers_for(symbol) {
                    let snapshot = registry.get_subscription(client);
                    prop_assert!(snapshot.is_some_and(|s| s.symbols.iter().any(|x| x == symbol)));
                }
            }
        }
    }
}
