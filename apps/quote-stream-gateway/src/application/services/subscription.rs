//! Subscription Service
//!
//! Coordinates the registry and the connection pool: the first client to
//! want a symbol on a feed extends the upstream subscription, the last one
//! to leave shrinks it. Validation of client requests happens here so the
//! registry only ever sees well-formed symbols.
//!
//! Registry changes and the upstream calls they trigger run under a per-feed
//! lock, so a rollback or shrink on one feed never interleaves with another
//! client's subscribe on the same feed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::application::error::ServiceError;
use crate::application::ports::Principal;
use crate::application::services::connection_pool::ConnectionPool;
use crate::domain::streaming::{CapabilityType, ClientId, FeedKey, ProviderName, Symbol};
use crate::domain::subscription::{SharedSink, SubscriptionChanges, SubscriptionRegistry};
use crate::infrastructure::metrics;

/// Longest accepted symbol (OCC option symbols are 21 characters).
const MAX_SYMBOL_LEN: usize = 32;

/// Request limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionLimits {
    /// Most symbols one client may hold.
    pub max_symbols_per_client: usize,
    /// Provider used when a request names none.
    pub default_provider: ProviderName,
}

impl Default for SubscriptionLimits {
    fn default() -> Self {
        Self {
            max_symbols_per_client: 500,
            default_provider: "alpaca".to_string(),
        }
    }
}

/// A client's subscribe request.
#[derive(Debug, Clone, Copy)]
pub struct SubscribeRequest<'a> {
    /// Requested symbols, as sent.
    pub symbols: &'a [String],
    /// Requested feed type.
    pub capability: CapabilityType,
    /// Requested provider, if any.
    pub provider: Option<&'a str>,
}

/// Registry plus pool coordination.
pub struct SubscriptionService {
    registry: Arc<SubscriptionRegistry>,
    pool: Arc<ConnectionPool>,
    limits: SubscriptionLimits,
    feed_locks: Mutex<HashMap<FeedKey, Arc<AsyncMutex<()>>>>,
}

impl SubscriptionService {
    /// Create the service.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        pool: Arc<ConnectionPool>,
        limits: SubscriptionLimits,
    ) -> Self {
        Self {
            registry,
            pool,
            limits,
            feed_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Subscribe a client. Returns the normalized symbols, including any the
    /// client already held.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Validation`] for malformed or disallowed
    /// requests and [`ServiceError::Upstream`] when the upstream feed could
    /// not be extended; in the latter case the registry change is rolled
    /// back.
    pub async fn subscribe(
        &self,
        client_id: ClientId,
        principal: &Principal,
        request: SubscribeRequest<'_>,
        sink: SharedSink,
    ) -> Result<Vec<Symbol>, ServiceError> {
        if !principal.permits(request.capability) {
            return Err(ServiceError::validation(format!(
                "not permitted to subscribe to {}",
                request.capability
            )));
        }

        let symbols = normalize_symbols(request.symbols)?;
        let provider = request.provider.map_or_else(
            || self.limits.default_provider.clone(),
            |p| p.trim().to_lowercase(),
        );
        if provider.is_empty() {
            return Err(ServiceError::validation("provider must not be empty"));
        }
        let feed = FeedKey::new(provider, request.capability);
        let _feed_guard = self.lock_feed(&feed).await;

        self.check_symbol_cap(client_id, &feed, &symbols)?;

        let outcome = self
            .registry
            .add_subscription(client_id, &symbols, feed.clone(), sink)?;

        let upstream = sorted(outcome.changes.subscribe);
        if let Err(e) = self.pool.subscribe_symbols(&feed, &upstream).await {
            tracing::warn!(client_id, %feed, error = %e, "Upstream subscribe failed, rolling back");
            self.registry
                .remove_subscription(client_id, Some(outcome.added.as_slice()));
            self.pool.release_if_idle(&feed).await;
            self.publish_gauges();
            return Err(e.into());
        }

        tracing::info!(
            client_id,
            %feed,
            requested = symbols.len(),
            added = outcome.added.len(),
            upstream = upstream.len(),
            "Client subscribed"
        );
        self.publish_gauges();
        Ok(symbols)
    }

    /// Unsubscribe a client from some or all symbols. Returns the symbols
    /// actually removed.
    ///
    /// Upstream shrink failures are logged, never returned.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Validation`] if the client holds nothing.
    pub async fn unsubscribe(
        &self,
        client_id: ClientId,
        symbols: Option<&[String]>,
    ) -> Result<Vec<Symbol>, ServiceError> {
        let held: HashSet<Symbol> = self
            .registry
            .get_subscription(client_id)
            .map(|snapshot| snapshot.symbols.into_iter().collect())
            .ok_or_else(|| ServiceError::validation("no active subscription"))?;

        let targets: Option<Vec<Symbol>> = symbols.map(|list| {
            list.iter()
                .map(|s| s.trim().to_uppercase())
                .filter(|s| held.contains(s))
                .collect()
        });
        let removed = targets.clone().unwrap_or_else(|| sorted(held));

        if let Some(changes) = self
            .registry
            .remove_subscription(client_id, targets.as_deref())
        {
            self.shrink_upstream(client_id, changes).await;
        }
        self.publish_gauges();

        tracing::info!(client_id, removed = removed.len(), "Client unsubscribed");
        Ok(removed)
    }

    /// Drop everything a disconnected client held.
    pub async fn disconnect(&self, client_id: ClientId) {
        if let Some(changes) = self.registry.remove_subscription(client_id, None) {
            tracing::debug!(client_id, "Cleaning up subscriptions for closed connection");
            self.shrink_upstream(client_id, changes).await;
            self.publish_gauges();
        }
    }

    /// Evict clients idle past `idle_timeout`, closing their connections.
    /// Returns how many were evicted.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> usize {
        let evicted = self.registry.evict_idle(Instant::now(), idle_timeout);
        let count = evicted.len();

        for client in evicted {
            tracing::info!(
                client_id = client.client_id,
                idle_secs = idle_timeout.as_secs(),
                "Evicting idle client"
            );
            client.sink.close();
            self.shrink_upstream(client.client_id, client.changes).await;
        }
        if count > 0 {
            self.publish_gauges();
        }
        count
    }

    /// Run the idle sweep every `interval` until cancelled.
    pub async fn run_idle_sweeper(
        self: Arc<Self>,
        interval: Duration,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Idle sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_idle(idle_timeout).await;
                }
            }
        }
    }

    fn check_symbol_cap(
        &self,
        client_id: ClientId,
        feed: &FeedKey,
        symbols: &[Symbol],
    ) -> Result<(), ServiceError> {
        let held: HashSet<Symbol> = self
            .registry
            .get_subscription(client_id)
            .filter(|s| s.provider == feed.provider && s.capability_type == feed.capability)
            .map(|s| s.symbols.into_iter().collect())
            .unwrap_or_default();

        let total = held.len() + symbols.iter().filter(|s| !held.contains(*s)).count();
        if total > self.limits.max_symbols_per_client {
            return Err(ServiceError::validation(format!(
                "subscription would hold {total} symbols, limit is {}",
                self.limits.max_symbols_per_client
            )));
        }
        Ok(())
    }

    async fn lock_feed(&self, feed: &FeedKey) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.feed_locks.lock().entry(feed.clone()).or_default());
        lock.lock_owned().await
    }

    /// Drop upstream symbols released by a registry removal. Symbols another
    /// client picked up again since the removal stay subscribed.
    async fn shrink_upstream(&self, client_id: ClientId, changes: SubscriptionChanges) {
        if changes.unsubscribe.is_empty() {
            return;
        }
        let feed = changes.feed;
        let _feed_guard = self.lock_feed(&feed).await;

        let symbols = sorted(
            changes
                .unsubscribe
                .into_iter()
                .filter(|symbol| !self.registry.is_required(&feed, symbol))
                .collect(),
        );
        if symbols.is_empty() {
            return;
        }
        if let Err(e) = self.pool.unsubscribe_symbols(&feed, &symbols).await {
            tracing::warn!(client_id, %feed, error = %e, "Upstream unsubscribe failed");
        }
    }

    fn publish_gauges(&self) {
        metrics::set_subscribed_symbols(self.registry.stats().symbol_count);
    }
}

fn sorted(symbols: HashSet<Symbol>) -> Vec<Symbol> {
    let mut symbols: Vec<Symbol> = symbols.into_iter().collect();
    symbols.sort_unstable();
    symbols
}

/// Trim, uppercase, validate and de-duplicate symbols, keeping first-seen
/// order.
fn normalize_symbols(raw: &[String]) -> Result<Vec<Symbol>, ServiceError> {
    if raw.is_empty() {
        return Err(ServiceError::validation("symbols must not be empty"));
    }

    let mut seen = HashSet::new();
    let mut symbols = Vec::with_capacity(raw.len());
    for symbol in raw {
        let normalized = symbol.trim().to_uppercase();
        if !is_valid_symbol(&normalized) {
            return Err(ServiceError::validation(format!("invalid symbol: {symbol:?}")));
        }
        if seen.insert(normalized.clone()) {
            symbols.push(normalized);
        }
    }
    Ok(symbols)
}

fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '/' | ' '))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::mpsc;

    use super::*;
    use crate::application::error::ErrorKind;
    use crate::application::ports::CapabilityConnector;
    use crate::application::services::connection_pool::PoolConfig;
    use crate::application::services::test_support::FakeConnector;
    use crate::domain::streaming::DataFrame;
    use crate::domain::subscription::{DeliveryError, FrameSink};

    #[derive(Default)]
    struct RecordingSink {
        closed: AtomicBool,
    }

    impl FrameSink for RecordingSink {
        fn deliver(&self, _frame: &DataFrame) -> Result<(), DeliveryError> {
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn service(
        connector: FakeConnector,
        limits: SubscriptionLimits,
    ) -> (SubscriptionService, Arc<FakeConnector>) {
        let connector = Arc::new(connector);
        let (tx, _rx) = mpsc::channel(16);
        let pool = ConnectionPool::new(
            Arc::clone(&connector) as Arc<dyn CapabilityConnector>,
            tx,
            PoolConfig::default(),
        );
        let service = SubscriptionService::new(
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(pool),
            limits,
        );
        (service, connector)
    }

    fn sink() -> SharedSink {
        Arc::new(RecordingSink::default())
    }

    fn request(symbols: &[String]) -> SubscribeRequest<'_> {
        SubscribeRequest {
            symbols,
            capability: CapabilityType::Quotes,
            provider: None,
        }
    }

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn shared_symbol_opens_upstream_once() {
        let (service, connector) = service(FakeConnector::new(), SubscriptionLimits::default());
        let principal = Principal::unrestricted("k");
        let symbols = strings(&["AAPL"]);

        service.subscribe(1, &principal, request(&symbols), sink()).await.unwrap();
        service.subscribe(2, &principal, request(&symbols), sink()).await.unwrap();

        assert_eq!(connector.opens(), 1);
        let capability = connector.capability(0);
        assert_eq!(capability.subscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.registry().get_subscribers_for("AAPL"), vec![1, 2]);
    }

    #[tokio::test]
    async fn normalizes_and_dedupes() {
        let (service, _) = service(FakeConnector::new(), SubscriptionLimits::default());
        let symbols = strings(&[" aapl ", "AAPL", "msft"]);

        let acked = service
            .subscribe(1, &Principal::unrestricted("k"), request(&symbols), sink())
            .await
            .unwrap();

        assert_eq!(acked, strings(&["AAPL", "MSFT"]));
    }

    #[tokio::test]
    async fn resubscribe_is_successful_noop() {
        let (service, connector) = service(FakeConnector::new(), SubscriptionLimits::default());
        let principal = Principal::unrestricted("k");
        let symbols = strings(&["AAPL"]);

        service.subscribe(1, &principal, request(&symbols), sink()).await.unwrap();
        let acked = service.subscribe(1, &principal, request(&symbols), sink()).await.unwrap();

        assert_eq!(acked, symbols);
        assert_eq!(connector.capability(0).subscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejects_invalid_requests() {
        let (service, connector) = service(
            FakeConnector::new(),
            SubscriptionLimits {
                max_symbols_per_client: 2,
                ..SubscriptionLimits::default()
            },
        );
        let principal = Principal::unrestricted("k");

        let empty: Vec<String> = Vec::new();
        let bad = strings(&["AA$PL"]);
        let many = strings(&["A", "B", "C"]);

        for symbols in [&empty, &bad, &many] {
            let err = service
                .subscribe(1, &principal, request(symbols), sink())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert_eq!(connector.opens(), 0);
    }

    #[tokio::test]
    async fn rejects_capability_not_permitted() {
        let (service, _) = service(FakeConnector::new(), SubscriptionLimits::default());
        let principal = Principal {
            api_key: "k".to_string(),
            capabilities: Some(HashSet::from([CapabilityType::Trades])),
        };
        let symbols = strings(&["AAPL"]);

        let err = service
            .subscribe(1, &principal, request(&symbols), sink())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn rejects_second_feed() {
        let (service, _) = service(FakeConnector::new(), SubscriptionLimits::default());
        let principal = Principal::unrestricted("k");
        let symbols = strings(&["AAPL"]);
        service.subscribe(1, &principal, request(&symbols), sink()).await.unwrap();

        let trades = SubscribeRequest {
            capability: CapabilityType::Trades,
            ..request(&symbols)
        };
        let err = service.subscribe(1, &principal, trades, sink()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn rolls_back_on_upstream_failure() {
        let connector = FakeConnector {
            fail_first_subscribes: 2,
            ..FakeConnector::new()
        };
        let (service, connector) = service(connector, SubscriptionLimits::default());
        let symbols = strings(&["AAPL"]);

        let err = service
            .subscribe(1, &Principal::unrestricted("k"), request(&symbols), sink())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        assert!(service.registry().get_subscription(1).is_none());
        assert!(service.registry().is_consistent());
        assert!(connector.capability(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_subscribe_does_not_strand_concurrent_subscriber() {
        let connector = FakeConnector {
            fail_first_subscribes: 2,
            open_delay: Duration::from_millis(50),
            ..FakeConnector::new()
        };
        let (service, connector) = service(connector, SubscriptionLimits::default());
        let principal = Principal::unrestricted("k");
        let symbols = strings(&["AAPL"]);

        let first = service.subscribe(1, &principal, request(&symbols), sink());
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            service.subscribe(2, &principal, request(&symbols), sink()).await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_err());
        assert_eq!(second.unwrap(), symbols);
        assert_eq!(service.registry().get_subscribers_for("AAPL"), vec![2]);
        assert_eq!(
            service.pool().open_feeds(),
            vec![FeedKey::new("alpaca", CapabilityType::Quotes)]
        );
        let live = connector.capability(1);
        assert!(live.subscribed().contains("AAPL"));
        assert!(!live.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn resubscribe_during_shrink_keeps_upstream_symbol() {
        let (service, connector) = service(FakeConnector::new(), SubscriptionLimits::default());
        let principal = Principal::unrestricted("k");
        let both = strings(&["AAPL", "MSFT"]);
        service.subscribe(1, &principal, request(&both), sink()).await.unwrap();

        // Client 1 drops AAPL in the registry; client 2 takes it back before
        // the upstream shrink runs.
        let changes = service
            .registry()
            .remove_subscription(1, Some(strings(&["AAPL"]).as_slice()))
            .unwrap();
        service
            .registry()
            .add_subscription(
                2,
                &strings(&["AAPL"]),
                FeedKey::new("alpaca", CapabilityType::Quotes),
                sink(),
            )
            .unwrap();
        service.shrink_upstream(1, changes).await;

        assert!(connector.capability(0).subscribed().contains("AAPL"));
        assert_eq!(connector.capability(0).unsubscribe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_shrinks_upstream_for_last_holder() {
        let (service, connector) = service(FakeConnector::new(), SubscriptionLimits::default());
        let principal = Principal::unrestricted("k");
        let both = strings(&["AAPL", "MSFT"]);
        let aapl = strings(&["AAPL"]);
        service.subscribe(1, &principal, request(&both), sink()).await.unwrap();
        service.subscribe(2, &principal, request(&aapl), sink()).await.unwrap();

        let removed = service.unsubscribe(1, Some(&both)).await.unwrap();

        assert_eq!(removed, both);
        let upstream = connector.capability(0).subscribed();
        assert!(upstream.contains("AAPL"));
        assert!(!upstream.contains("MSFT"));
    }

    #[tokio::test]
    async fn unsubscribe_without_subscription_fails() {
        let (service, _) = service(FakeConnector::new(), SubscriptionLimits::default());
        let err = service.unsubscribe(9, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn disconnect_releases_upstream() {
        let (service, connector) = service(FakeConnector::new(), SubscriptionLimits::default());
        let symbols = strings(&["AAPL"]);
        service
            .subscribe(1, &Principal::unrestricted("k"), request(&symbols), sink())
            .await
            .unwrap();

        service.disconnect(1).await;

        assert!(service.registry().get_subscribers_for("AAPL").is_empty());
        assert!(service.pool().open_feeds().is_empty());
        assert!(connector.capability(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn idle_sweep_closes_sink() {
        let (service, _) = service(FakeConnector::new(), SubscriptionLimits::default());
        let recording = Arc::new(RecordingSink::default());
        let symbols = strings(&["AAPL"]);
        service
            .subscribe(
                1,
                &Principal::unrestricted("k"),
                request(&symbols),
                Arc::clone(&recording) as SharedSink,
            )
            .await
            .unwrap();

        assert_eq!(service.sweep_idle(Duration::from_secs(300)).await, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(service.sweep_idle(Duration::ZERO).await, 1);

        assert!(recording.closed.load(Ordering::SeqCst));
        assert!(service.registry().get_subscription(1).is_none());
        assert!(service.pool().open_feeds().is_empty());
    }
}
