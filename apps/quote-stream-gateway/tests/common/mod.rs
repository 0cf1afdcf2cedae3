//! Shared fixtures for integration tests.
//!
//! Starts the full gateway stack on an ephemeral port with an in-memory
//! upstream connector, so tests drive real WebSocket clients end to end.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use quote_stream_gateway::application::ports::{
    CapabilityConnector, ClientCredentials, CredentialValidator, ErrorCallback, StatusCallback,
    UpstreamCapability, UpstreamError,
};
use quote_stream_gateway::application::services::SharedReplayWindow;
use quote_stream_gateway::domain::batching::AdaptiveBatchingConfig;
use quote_stream_gateway::domain::recovery::ReplayWindow;
use quote_stream_gateway::infrastructure::auth::StaticCredentialValidator;
use quote_stream_gateway::infrastructure::cache::InMemoryQuoteCache;
use quote_stream_gateway::infrastructure::config::ApiKeyEntry;
use quote_stream_gateway::infrastructure::gateway;
use quote_stream_gateway::infrastructure::transform::PassthroughTransformer;
use quote_stream_gateway::{
    BatchProcessor, BatchProcessorConfig, ConnectionPool, FeedKey, GatewayState, PoolConfig,
    QuoteEvent, RecoveryWorker, SubscriptionLimits, SubscriptionRegistry, SubscriptionService,
    Symbol,
};

pub const API_KEY: &str = "test-key";
pub const API_TOKEN: &str = "test-token";
pub const PROVIDER: &str = "alpaca";

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Upstream Fakes
// =============================================================================

/// Capability that records subscriptions and lets tests inject events.
pub struct FakeUpstream {
    feed: FeedKey,
    events: mpsc::Sender<QuoteEvent>,
    subscribed: Mutex<HashSet<Symbol>>,
    closed: AtomicBool,
}

impl FakeUpstream {
    pub fn subscribed(&self) -> HashSet<Symbol> {
        self.subscribed.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Push one provider event for `symbol`.
    pub async fn emit(&self, symbol: &str, payload: Value) {
        let event = QuoteEvent::new(
            self.feed.provider.clone(),
            self.feed.capability,
            vec![symbol.to_string()],
            payload,
        );
        self.events.send(event).await.unwrap();
    }
}

#[async_trait]
impl UpstreamCapability for FakeUpstream {
    fn feed(&self) -> FeedKey {
        self.feed.clone()
    }

    fn is_ready(&self) -> bool {
        !self.is_closed()
    }

    async fn subscribe(&self, symbols: &[Symbol]) -> Result<(), UpstreamError> {
        self.subscribed.lock().extend(symbols.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[Symbol]) -> Result<(), UpstreamError> {
        let mut subscribed = self.subscribed.lock();
        for symbol in symbols {
            subscribed.remove(symbol);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_status_change(&self, _callback: StatusCallback) {}

    fn on_error(&self, _callback: ErrorCallback) {}
}

/// Connector handing out [`FakeUpstream`]s.
#[derive(Default)]
pub struct FakeConnector {
    opens: AtomicU32,
    upstreams: Mutex<Vec<Arc<FakeUpstream>>>,
}

impl FakeConnector {
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn upstream(&self, index: usize) -> Arc<FakeUpstream> {
        Arc::clone(&self.upstreams.lock()[index])
    }
}

#[async_trait]
impl CapabilityConnector for FakeConnector {
    async fn open(
        &self,
        feed: &FeedKey,
        events: mpsc::Sender<QuoteEvent>,
    ) -> Result<Arc<dyn UpstreamCapability>, UpstreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let upstream = Arc::new(FakeUpstream {
            feed: feed.clone(),
            events,
            subscribed: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });
        self.upstreams.lock().push(Arc::clone(&upstream));
        Ok(upstream)
    }
}

// =============================================================================
// Gateway Harness
// =============================================================================

/// A running gateway wired to a [`FakeConnector`].
pub struct TestGateway {
    pub addr: SocketAddr,
    pub connector: Arc<FakeConnector>,
    pub registry: Arc<SubscriptionRegistry>,
    pub pool: Arc<ConnectionPool>,
    pub processor: Arc<BatchProcessor>,
    pub state: Arc<GatewayState>,
    pub cancel: CancellationToken,
}

impl TestGateway {
    pub async fn start() -> Self {
        let cancel = CancellationToken::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let replay: SharedReplayWindow = Arc::new(Mutex::new(ReplayWindow::new(
            Duration::from_secs(60),
            1_000,
        )));

        let config = BatchProcessorConfig {
            adaptive: AdaptiveBatchingConfig {
                initial_interval: Duration::from_millis(20),
                ..AdaptiveBatchingConfig::default()
            },
            ..BatchProcessorConfig::default()
        };
        let processor = BatchProcessor::new(
            config,
            Arc::clone(&registry),
            Arc::new(PassthroughTransformer::new()),
            Arc::new(InMemoryQuoteCache::new()),
            Arc::clone(&replay),
        );
        let (events_tx, events_rx) = mpsc::channel(256);
        let _tasks = processor.start(events_rx, cancel.clone());

        let connector = Arc::new(FakeConnector::default());
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&connector) as Arc<dyn CapabilityConnector>,
            events_tx,
            PoolConfig {
                poll_interval: Duration::from_millis(10),
                ..PoolConfig::default()
            },
        ));
        let subscriptions = Arc::new(SubscriptionService::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            SubscriptionLimits {
                max_symbols_per_client: 10,
                default_provider: PROVIDER.to_string(),
            },
        ));
        let recovery = Arc::new(RecoveryWorker::new(
            Arc::clone(&registry),
            replay,
            Duration::from_secs(300),
        ));
        let validator: Arc<dyn CredentialValidator> =
            Arc::new(StaticCredentialValidator::new([ApiKeyEntry {
                credentials: ClientCredentials::new(API_KEY, API_TOKEN),
                capabilities: None,
            }]));

        let state = Arc::new(GatewayState::new(
            subscriptions,
            recovery,
            Arc::clone(&processor),
            validator,
            "test-0.0.1",
            64,
            Duration::from_secs(30),
            cancel.clone(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(gateway::serve(listener, Arc::clone(&state), cancel.clone()));

        Self {
            addr,
            connector,
            registry,
            pool,
            processor,
            state,
            cancel,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Connect with the test credentials and consume the `connected` frame.
    pub async fn connect(&self) -> (Client, u64) {
        let mut request = self.url().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("x-api-key", API_KEY.parse().unwrap());
        request
            .headers_mut()
            .insert("x-api-token", API_TOKEN.parse().unwrap());

        let (mut client, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        let connected = next_json(&mut client).await;
        assert_eq!(connected["type"], "connected");
        let client_id = connected["clientId"].as_u64().unwrap();
        (client, client_id)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Client Helpers
// =============================================================================

pub async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Next JSON text frame, skipping control frames. Panics after two seconds.
pub async fn next_json(client: &mut Client) -> Value {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Next frame of the given `type`, skipping others.
pub async fn next_of_type(client: &mut Client, kind: &str) -> Value {
    loop {
        let message = next_json(client).await;
        if message["type"] == kind {
            return message;
        }
    }
}

/// Whether a text frame arrives within `wait`.
pub async fn receives_within(client: &mut Client, wait: Duration) -> Option<Value> {
    tokio::time::timeout(wait, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(&text).unwrap();
                }
                Some(Ok(_)) => {}
                _ => std::future::pending::<()>().await,
            }
        }
    })
    .await
    .ok()
}

/// Subscribe to quotes and wait for the ack.
pub async fn subscribe(client: &mut Client, symbols: &[&str]) -> Value {
    send_json(
        client,
        serde_json::json!({
            "type": "subscribe",
            "symbols": symbols,
            "capabilityType": "quotes",
        }),
    )
    .await;
    next_json(client).await
}

/// Poll `condition` every 10 ms for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
