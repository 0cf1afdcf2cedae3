//! WebSocket Upstream Capability
//!
//! One WebSocket session per (provider, capability). The session task
//! manages the connection lifecycle:
//!
//! - Authentication when the provider has credentials configured
//! - Heartbeat monitoring
//! - Automatic reconnection with exponential backoff
//! - Subscription restore after every reconnect
//!
//! Market data messages for the capability's channel become
//! [`QuoteEvent`]s on the pipeline's event sender.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::codec::{self, SubscriptionAction, UpstreamFrame};
use super::heartbeat::{Heartbeat, HeartbeatAction, HeartbeatConfig};
use crate::application::ports::{
    CapabilityConnector, CapabilityStatus, ErrorCallback, StatusCallback, UpstreamCapability,
    UpstreamError,
};
use crate::domain::resilience::BackoffPolicy;
use crate::domain::streaming::{FeedKey, QuoteEvent, Symbol};
use crate::infrastructure::config::{Credentials, UpstreamSettings, WebSocketSettings};
use crate::infrastructure::metrics;

/// Queued requests per capability.
const COMMAND_CAPACITY: usize = 64;

enum Command {
    Send(String),
    Ping(oneshot::Sender<()>),
}

/// How a session ended without error.
enum SessionEnd {
    Cancelled,
    PipelineClosed,
}

// =============================================================================
// Capability
// =============================================================================

/// WebSocket-backed [`UpstreamCapability`].
pub struct WsCapability {
    feed: FeedKey,
    url: String,
    credentials: Option<Credentials>,
    settings: WebSocketSettings,
    status: RwLock<CapabilityStatus>,
    symbols: RwLock<HashSet<Symbol>>,
    commands: mpsc::Sender<Command>,
    status_callbacks: RwLock<Vec<StatusCallback>>,
    error_callbacks: RwLock<Vec<ErrorCallback>>,
    cancel: CancellationToken,
}

impl WsCapability {
    fn new(
        feed: FeedKey,
        url: String,
        credentials: Option<Credentials>,
        settings: WebSocketSettings,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Command>) {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let capability = Arc::new(Self {
            feed,
            url,
            credentials,
            settings,
            status: RwLock::new(CapabilityStatus::Connecting),
            symbols: RwLock::new(HashSet::new()),
            commands,
            status_callbacks: RwLock::new(Vec::new()),
            error_callbacks: RwLock::new(Vec::new()),
            cancel,
        });
        (capability, rx)
    }

    fn status(&self) -> CapabilityStatus {
        *self.status.read()
    }

    fn set_status(&self, status: CapabilityStatus) {
        {
            let mut current = self.status.write();
            if *current == status {
                return;
            }
            *current = status;
        }
        tracing::info!(feed = %self.feed, status = %status, "Upstream status changed");
        for callback in self.status_callbacks.read().iter() {
            callback(status);
        }
    }

    fn emit_error(&self, error: &UpstreamError) {
        metrics::record_upstream_error(&self.feed.provider, error_type(error));
        for callback in self.error_callbacks.read().iter() {
            callback(error);
        }
    }

    async fn send_command(&self, command: Command) -> Result<(), UpstreamError> {
        if self.cancel.is_cancelled() {
            return Err(UpstreamError::Closed);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| UpstreamError::Closed)
    }

    fn subscription_request(&self, action: SubscriptionAction, symbols: &[Symbol]) -> String {
        codec::encode_subscription(action, self.feed.capability, symbols)
    }

    // =========================================================================
    // Session Loop
    // =========================================================================

    async fn run(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<Command>,
        events: mpsc::Sender<QuoteEvent>,
    ) {
        let mut backoff = BackoffPolicy::new(self.settings.reconnect_backoff());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.connect_and_run(&mut commands, &events, &mut backoff).await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::PipelineClosed) => {
                    tracing::info!(feed = %self.feed, "Event pipeline closed, stopping upstream");
                    break;
                }
                Err(e) => {
                    tracing::warn!(feed = %self.feed, error = %e, "Upstream connection error");
                    self.emit_error(&e);

                    let Some(delay) = backoff.next_delay() else {
                        tracing::error!(feed = %self.feed, "Upstream reconnect attempts exhausted");
                        self.set_status(CapabilityStatus::Failed);
                        return;
                    };
                    self.set_status(CapabilityStatus::Reconnecting);
                    metrics::record_upstream_reconnect(&self.feed.provider);
                    tracing::info!(
                        feed = %self.feed,
                        attempt = backoff.attempt_count(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Reconnecting upstream"
                    );

                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.set_status(CapabilityStatus::Closed);
    }

    async fn connect_and_run(
        &self,
        commands: &mut mpsc::Receiver<Command>,
        events: &mpsc::Sender<QuoteEvent>,
        backoff: &mut BackoffPolicy,
    ) -> Result<SessionEnd, UpstreamError> {
        tracing::info!(feed = %self.feed, url = %self.url, "Connecting upstream");

        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            connected = tokio_tungstenite::connect_async(self.url.as_str()) => {
                connected.map_err(|e| UpstreamError::ConnectFailed(e.to_string()))?
            }
        };
        let (mut write, mut read) = ws_stream.split();

        let mut authenticated = self.credentials.is_none();
        if authenticated {
            self.on_ready(&mut write, backoff).await?;
        }

        let heartbeat_config = HeartbeatConfig::from_websocket_settings(&self.settings);
        let mut heartbeat = Heartbeat::new(heartbeat_config, std::time::Instant::now());
        let mut ticker = interval_at(Instant::now() + heartbeat.interval(), heartbeat.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pending_pings: Vec<oneshot::Sender<()>> = Vec::new();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Cancelled);
                }

                _ = ticker.tick() => match heartbeat.on_tick(std::time::Instant::now()) {
                    HeartbeatAction::SendPing => {
                        write.send(Message::Ping(Vec::new().into())).await.map_err(send_failed)?;
                    }
                    HeartbeatAction::TimedOut { silent_for } => {
                        return Err(UpstreamError::ConnectFailed(format!(
                            "heartbeat timeout after {silent_for:?}"
                        )));
                    }
                },

                command = commands.recv(), if authenticated => match command {
                    Some(Command::Send(text)) => {
                        write.send(Message::Text(text.into())).await.map_err(send_failed)?;
                    }
                    Some(Command::Ping(reply)) => {
                        write.send(Message::Ping(Vec::new().into())).await.map_err(send_failed)?;
                        pending_pings.push(reply);
                    }
                    None => return Ok(SessionEnd::Cancelled),
                },

                message = read.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(UpstreamError::ConnectFailed(e.to_string())),
                        None => {
                            return Err(UpstreamError::ConnectFailed("stream ended".to_string()));
                        }
                    };
                    heartbeat.record_activity(std::time::Instant::now());

                    match message {
                        Message::Text(text) => {
                            let step = self
                                .handle_text(&text, &mut write, events, &mut authenticated, backoff)
                                .await?;
                            if let Some(end) = step {
                                return Ok(end);
                            }
                        }
                        Message::Pong(_) => {
                            for reply in pending_pings.drain(..) {
                                let _ = reply.send(());
                            }
                        }
                        Message::Ping(data) => {
                            write.send(Message::Pong(data)).await.map_err(send_failed)?;
                        }
                        Message::Close(_) => {
                            return Err(UpstreamError::ConnectFailed(
                                "server closed connection".to_string(),
                            ));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Apply one text message. `Some` ends the session cleanly.
    async fn handle_text<W>(
        &self,
        text: &str,
        write: &mut W,
        events: &mpsc::Sender<QuoteEvent>,
        authenticated: &mut bool,
        backoff: &mut BackoffPolicy,
    ) -> Result<Option<SessionEnd>, UpstreamError>
    where
        W: Sink<Message> + Unpin,
        W::Error: std::fmt::Display,
    {
        let frames = match codec::decode(text) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::debug!(feed = %self.feed, error = %e, "Undecodable upstream message");
                return Ok(None);
            }
        };

        for frame in frames {
            match frame {
                UpstreamFrame::Success(msg) if !*authenticated => {
                    if msg == "connected"
                        && let Some(credentials) = &self.credentials
                    {
                        write
                            .send(Message::Text(codec::encode_auth(credentials).into()))
                            .await
                            .map_err(|e| UpstreamError::ConnectFailed(e.to_string()))?;
                    } else if msg == "authenticated" {
                        *authenticated = true;
                        self.on_ready(write, backoff).await?;
                    }
                }
                UpstreamFrame::Success(_) | UpstreamFrame::Other(_) => {}
                UpstreamFrame::Error { code, message } => {
                    let error = UpstreamError::Upstream { code, message };
                    if !*authenticated {
                        return Err(error);
                    }
                    tracing::warn!(feed = %self.feed, error = %error, "Upstream reported error");
                    self.emit_error(&error);
                }
                UpstreamFrame::Subscription(confirmed) => {
                    tracing::debug!(feed = %self.feed, subscription = %confirmed, "Subscription confirmed");
                }
                UpstreamFrame::Data {
                    kind,
                    symbol,
                    payload,
                } => {
                    if kind != codec::data_kind_for(self.feed.capability) {
                        continue;
                    }
                    let event = QuoteEvent::new(
                        self.feed.provider.clone(),
                        self.feed.capability,
                        vec![symbol],
                        payload,
                    );
                    if events.send(event).await.is_err() {
                        return Ok(Some(SessionEnd::PipelineClosed));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn on_ready<W>(
        &self,
        write: &mut W,
        backoff: &mut BackoffPolicy,
    ) -> Result<(), UpstreamError>
    where
        W: Sink<Message> + Unpin,
        W::Error: std::fmt::Display,
    {
        backoff.reset();
        self.set_status(CapabilityStatus::Ready);

        let symbols: Vec<Symbol> = {
            let mut symbols: Vec<_> = self.symbols.read().iter().cloned().collect();
            symbols.sort();
            symbols
        };
        if !symbols.is_empty() {
            tracing::info!(
                feed = %self.feed,
                count = symbols.len(),
                "Restoring upstream subscriptions"
            );
            let request = self.subscription_request(SubscriptionAction::Subscribe, &symbols);
            write
                .send(Message::Text(request.into()))
                .await
                .map_err(|e| UpstreamError::RequestFailed(e.to_string()))?;
        }
        Ok(())
    }
}

fn send_failed(e: tokio_tungstenite::tungstenite::Error) -> UpstreamError {
    UpstreamError::ConnectFailed(e.to_string())
}

const fn error_type(error: &UpstreamError) -> &'static str {
    match error {
        UpstreamError::UnknownProvider(_) => "unknown_provider",
        UpstreamError::ConnectFailed(_) => "connect_failed",
        UpstreamError::ReadyTimeout(_) => "ready_timeout",
        UpstreamError::RequestFailed(_) => "request_failed",
        UpstreamError::Closed => "closed",
        UpstreamError::Upstream { .. } => "upstream",
    }
}

#[async_trait]
impl UpstreamCapability for WsCapability {
    fn feed(&self) -> FeedKey {
        self.feed.clone()
    }

    fn is_ready(&self) -> bool {
        self.status() == CapabilityStatus::Ready
    }

    async fn subscribe(&self, symbols: &[Symbol]) -> Result<(), UpstreamError> {
        self.symbols.write().extend(symbols.iter().cloned());
        // Not ready: the restore on (re)connect covers these symbols.
        if !self.is_ready() {
            return Ok(());
        }
        let request = self.subscription_request(SubscriptionAction::Subscribe, symbols);
        self.send_command(Command::Send(request)).await
    }

    async fn unsubscribe(&self, symbols: &[Symbol]) -> Result<(), UpstreamError> {
        {
            let mut held = self.symbols.write();
            for symbol in symbols {
                held.remove(symbol);
            }
        }
        if !self.is_ready() {
            return Ok(());
        }
        let request = self.subscription_request(SubscriptionAction::Unsubscribe, symbols);
        self.send_command(Command::Send(request)).await
    }

    async fn ping(&self) -> Result<(), UpstreamError> {
        if !self.is_ready() {
            return Err(UpstreamError::RequestFailed(format!(
                "capability is {}",
                self.status()
            )));
        }
        let (reply, pong) = oneshot::channel();
        self.send_command(Command::Ping(reply)).await?;
        pong.await.map_err(|_| UpstreamError::Closed)
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        self.cancel.cancel();
        self.set_status(CapabilityStatus::Closed);
        Ok(())
    }

    fn on_status_change(&self, callback: StatusCallback) {
        self.status_callbacks.write().push(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.error_callbacks.write().push(callback);
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Opens [`WsCapability`] sessions from configured endpoints.
pub struct WsCapabilityConnector {
    settings: UpstreamSettings,
    cancel: CancellationToken,
}

impl WsCapabilityConnector {
    /// Create a connector. Sessions stop when `cancel` fires.
    #[must_use]
    pub const fn new(settings: UpstreamSettings, cancel: CancellationToken) -> Self {
        Self { settings, cancel }
    }
}

#[async_trait]
impl CapabilityConnector for WsCapabilityConnector {
    async fn open(
        &self,
        feed: &FeedKey,
        events: mpsc::Sender<QuoteEvent>,
    ) -> Result<Arc<dyn UpstreamCapability>, UpstreamError> {
        let url = self
            .settings
            .endpoint_for(feed)
            .ok_or_else(|| UpstreamError::UnknownProvider(feed.provider.clone()))?
            .to_string();

        let (capability, commands) = WsCapability::new(
            feed.clone(),
            url,
            self.settings.credentials.get(&feed.provider).cloned(),
            self.settings.websocket.clone(),
            self.cancel.child_token(),
        );
        tokio::spawn(Arc::clone(&capability).run(commands, events));

        Ok(capability)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio_tungstenite::WebSocketStream;

    use super::*;
    use crate::domain::streaming::CapabilityType;

    type ServerSocket = WebSocketStream<tokio::net::TcpStream>;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> ServerSocket {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn next_json(socket: &mut ServerSocket) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), socket.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn settings(url: &str, credentials: Option<Credentials>) -> UpstreamSettings {
        UpstreamSettings {
            endpoints: BTreeMap::from([("alpaca".to_string(), url.to_string())]),
            credentials: credentials
                .map(|c| BTreeMap::from([("alpaca".to_string(), c)]))
                .unwrap_or_default(),
            websocket: WebSocketSettings {
                reconnect_delay_initial: Duration::from_millis(20),
                reconnect_delay_max: Duration::from_millis(50),
                ..WebSocketSettings::default()
            },
        }
    }

    async fn wait_ready(capability: &Arc<dyn UpstreamCapability>) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !capability.is_ready() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    fn quotes() -> FeedKey {
        FeedKey::new("alpaca", CapabilityType::Quotes)
    }

    #[tokio::test]
    async fn streams_events_for_subscribed_channel() {
        let (listener, url) = listener().await;
        let connector = WsCapabilityConnector::new(settings(&url, None), CancellationToken::new());
        let (tx, mut rx) = mpsc::channel(16);

        let capability = connector.open(&quotes(), tx).await.unwrap();
        let mut server = accept(&listener).await;
        wait_ready(&capability).await;

        capability.subscribe(&["AAPL".to_string()]).await.unwrap();
        let request = next_json(&mut server).await;
        assert_eq!(request["action"], "subscribe");
        assert_eq!(request["quotes"][0], "AAPL");

        server
            .send(Message::Text(
                r#"[{"T":"t","S":"AAPL","p":1.0},{"T":"q","S":"AAPL","bp":1.5}]"#.into(),
            ))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.symbols, vec!["AAPL".to_string()]);
        assert_eq!(event.capability, CapabilityType::Quotes);
        assert_eq!(event.raw_payload["bp"], 1.5);

        capability.close().await.unwrap();
        assert!(!capability.is_ready());
    }

    #[tokio::test]
    async fn authenticates_before_ready() {
        let (listener, url) = listener().await;
        let creds = Credentials::new("key".to_string(), "secret".to_string());
        let connector =
            WsCapabilityConnector::new(settings(&url, Some(creds)), CancellationToken::new());
        let (tx, _rx) = mpsc::channel(16);

        let capability = connector.open(&quotes(), tx).await.unwrap();
        let mut server = accept(&listener).await;
        server
            .send(Message::Text(r#"[{"T":"success","msg":"connected"}]"#.into()))
            .await
            .unwrap();

        let auth = next_json(&mut server).await;
        assert_eq!(auth["action"], "auth");
        assert_eq!(auth["key"], "key");
        assert!(!capability.is_ready());

        server
            .send(Message::Text(r#"[{"T":"success","msg":"authenticated"}]"#.into()))
            .await
            .unwrap();
        wait_ready(&capability).await;
        capability.close().await.unwrap();
    }

    #[tokio::test]
    async fn restores_subscriptions_after_reconnect() {
        let (listener, url) = listener().await;
        let connector = WsCapabilityConnector::new(settings(&url, None), CancellationToken::new());
        let (tx, _rx) = mpsc::channel(16);

        let capability = connector.open(&quotes(), tx).await.unwrap();
        let mut first = accept(&listener).await;
        wait_ready(&capability).await;
        capability.subscribe(&["MSFT".to_string()]).await.unwrap();
        assert_eq!(next_json(&mut first).await["quotes"][0], "MSFT");

        drop(first);

        let mut second = accept(&listener).await;
        let restored = next_json(&mut second).await;
        assert_eq!(restored["action"], "subscribe");
        assert_eq!(restored["quotes"][0], "MSFT");

        capability.close().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let connector =
            WsCapabilityConnector::new(UpstreamSettings::default(), CancellationToken::new());
        let (tx, _rx) = mpsc::channel(1);

        let err = connector.open(&quotes(), tx).await.err().unwrap();
        assert_eq!(err, UpstreamError::UnknownProvider("alpaca".to_string()));
    }

    #[tokio::test]
    async fn status_callbacks_observe_lifecycle() {
        let (listener, url) = listener().await;
        let connector = WsCapabilityConnector::new(settings(&url, None), CancellationToken::new());
        let (tx, _rx) = mpsc::channel(16);

        let capability = connector.open(&quotes(), tx).await.unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        capability.on_status_change(Box::new(move |status| sink.lock().push(status)));

        let _server = accept(&listener).await;
        wait_ready(&capability).await;
        capability.close().await.unwrap();

        assert_eq!(seen.lock().last(), Some(&CapabilityStatus::Closed));
    }
}
