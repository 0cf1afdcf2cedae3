//! Client Session
//!
//! One task pair per WebSocket: the reader handles client messages inline,
//! the writer drains the bounded outbound queue and sends pings. Broadcasts
//! reach the queue through [`ClientSink`] without ever waiting on the
//! socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientMessage, ServerMessage, now_millis};
use crate::application::error::{ErrorKind, ServiceError};
use crate::application::ports::{CredentialValidator, Principal};
use crate::application::services::{
    BatchProcessor, RecoveryWorker, SubscribeRequest, SubscriptionService,
};
use crate::domain::recovery::RecoveryReason;
use crate::domain::streaming::{CapabilityType, ClientId, DataFrame, next_client_id};
use crate::domain::subscription::{DeliveryError, FrameSink, SharedSink};
use crate::infrastructure::metrics;

/// Longest wait for the close frame on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Shared State
// =============================================================================

/// Everything a session needs.
pub struct GatewayState {
    pub(crate) subscriptions: Arc<SubscriptionService>,
    pub(crate) recovery: Arc<RecoveryWorker>,
    pub(crate) processor: Arc<BatchProcessor>,
    pub(crate) validator: Arc<dyn CredentialValidator>,
    version: String,
    queue_capacity: usize,
    ping_interval: Duration,
    shutdown: CancellationToken,
    connections: AtomicUsize,
}

impl GatewayState {
    /// Wire the gateway to the application services.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscriptions: Arc<SubscriptionService>,
        recovery: Arc<RecoveryWorker>,
        processor: Arc<BatchProcessor>,
        validator: Arc<dyn CredentialValidator>,
        version: impl Into<String>,
        queue_capacity: usize,
        ping_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            subscriptions,
            recovery,
            processor,
            validator,
            version: version.into(),
            queue_capacity: queue_capacity.max(1),
            ping_interval,
            shutdown,
            connections: AtomicUsize::new(0),
        }
    }

    /// Open WebSocket connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    fn connection_opened(&self) {
        let count = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_connected_clients(count);
    }

    fn connection_closed(&self) {
        let count = self.connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::set_connected_clients(count);
    }
}

// =============================================================================
// Client Sink
// =============================================================================

/// Registry sink feeding a client's outbound queue.
pub struct ClientSink {
    outbound: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
}

impl ClientSink {
    /// Sink over a queue; `close` cancels `cancel`.
    #[must_use]
    pub const fn new(outbound: mpsc::Sender<ServerMessage>, cancel: CancellationToken) -> Self {
        Self { outbound, cancel }
    }
}

impl FrameSink for ClientSink {
    fn deliver(&self, frame: &DataFrame) -> Result<(), DeliveryError> {
        match self.outbound.try_send(ServerMessage::data(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Disconnected),
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Session
// =============================================================================

/// Run one authenticated connection to completion.
pub async fn run_session(socket: WebSocket, state: Arc<GatewayState>, principal: Principal) {
    let client_id = next_client_id();
    let cancel = state.shutdown.child_token();
    let (outbound, queue) = mpsc::channel(state.queue_capacity);
    let sink: SharedSink = Arc::new(ClientSink::new(outbound.clone(), cancel.clone()));

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(ws_tx, queue, state.ping_interval, cancel.clone()));

    state.connection_opened();
    tracing::info!(client_id, api_key = %principal.api_key, "Client connected");

    let session = Session {
        client_id,
        principal,
        state: Arc::clone(&state),
        outbound,
        sink,
    };
    session
        .reply(ServerMessage::Connected {
            client_id,
            timestamp: now_millis(),
        })
        .await;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    session.touch();
                    session.handle_text(text.as_str()).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    session.touch();
                    session
                        .reply_error(ErrorKind::Validation, "binary frames are not supported")
                        .await;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => session.touch(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(client_id, error = %e, "Client socket error");
                    break;
                }
            },
        }
    }

    cancel.cancel();
    state.subscriptions.disconnect(client_id).await;
    drop(session);
    if let Err(e) = writer.await {
        tracing::warn!(client_id, error = %e, "Client writer task failed");
    }
    state.connection_closed();
    tracing::info!(client_id, "Client disconnected");
}

/// Drain the outbound queue into the socket until cancelled. A send stuck
/// on a stalled socket is abandoned as soon as the session is cancelled.
async fn write_loop<W>(
    mut ws_tx: W,
    mut queue: mpsc::Receiver<ServerMessage>,
    ping_interval: Duration,
    cancel: CancellationToken,
) where
    W: Sink<Message> + Unpin,
{
    let mut ping = interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let outgoing = tokio::select! {
            () = cancel.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws_tx.send(Message::Close(None))).await;
                break;
            }
            _ = ping.tick() => Message::Ping(Vec::new().into()),
            message = queue.recv() => match message {
                Some(message) => match message.to_json() {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping unencodable frame");
                        continue;
                    }
                },
                None => break,
            },
        };

        let sent = tokio::select! {
            () = cancel.cancelled() => break,
            sent = ws_tx.send(outgoing) => sent,
        };
        if sent.is_err() {
            // Socket is gone; the reader side cleans up.
            cancel.cancel();
            break;
        }
    }
}

struct Session {
    client_id: ClientId,
    principal: Principal,
    state: Arc<GatewayState>,
    outbound: mpsc::Sender<ServerMessage>,
    sink: SharedSink,
}

impl Session {
    fn touch(&self) {
        self.state.subscriptions.registry().touch(self.client_id);
    }

    async fn reply(&self, message: ServerMessage) {
        // A closed queue means the writer is gone and the session is ending.
        let _ = self.outbound.send(message).await;
    }

    async fn reply_error(&self, code: ErrorKind, message: impl Into<String>) {
        self.reply(ServerMessage::Error {
            code,
            message: message.into(),
            timestamp: now_millis(),
        })
        .await;
    }

    async fn handle_text(&self, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(client_id = self.client_id, error = %e, "Malformed client message");
                metrics::record_error(ErrorKind::Validation);
                self.reply_error(ErrorKind::Validation, format!("malformed message: {e}"))
                    .await;
                return;
            }
        };

        match message {
            ClientMessage::Subscribe {
                symbols,
                capability_type,
                provider,
            } => {
                self.subscribe(symbols, &capability_type, provider.as_deref())
                    .await;
            }
            ClientMessage::Unsubscribe { symbols } => self.unsubscribe(symbols.as_deref()).await,
            ClientMessage::Ping => {
                self.reply(ServerMessage::Pong {
                    timestamp: now_millis(),
                })
                .await;
            }
            ClientMessage::RequestRecovery {
                symbols,
                last_receive_timestamp,
                reason,
            } => {
                self.recover(
                    &symbols,
                    last_receive_timestamp,
                    reason.unwrap_or(RecoveryReason::Reconnect),
                )
                .await;
            }
            ClientMessage::GetSubscription => {
                let snapshot = self
                    .state
                    .subscriptions
                    .registry()
                    .get_subscription(self.client_id);
                self.reply(ServerMessage::subscription(snapshot)).await;
            }
            ClientMessage::GetInfo => self.reply(self.info()).await,
        }
    }

    async fn subscribe(&self, symbols: Vec<String>, capability: &str, provider: Option<&str>) {
        let result = match CapabilityType::from_str_case_insensitive(capability) {
            Some(capability) => self
                .state
                .subscriptions
                .subscribe(
                    self.client_id,
                    &self.principal,
                    SubscribeRequest {
                        symbols: &symbols,
                        capability,
                        provider,
                    },
                    Arc::clone(&self.sink),
                )
                .await
                .map(|subscribed| (subscribed, capability)),
            None => Err(ServiceError::validation(format!(
                "unknown capability type: {capability:?}"
            ))),
        };

        let reply = match result {
            Ok((subscribed, capability_type)) => ServerMessage::SubscribeAck {
                symbols: subscribed,
                capability_type,
                timestamp: now_millis(),
            },
            Err(e) => {
                tracing::debug!(client_id = self.client_id, error = %e, "Subscribe rejected");
                metrics::record_error(e.kind());
                ServerMessage::SubscribeError {
                    message: e.to_string(),
                    code: e.kind(),
                    symbols,
                    timestamp: now_millis(),
                }
            }
        };
        self.reply(reply).await;
    }

    async fn unsubscribe(&self, symbols: Option<&[String]>) {
        let reply = match self.state.subscriptions.unsubscribe(self.client_id, symbols).await {
            Ok(removed) => ServerMessage::UnsubscribeAck {
                symbols: removed,
                timestamp: now_millis(),
            },
            Err(e) => ServerMessage::UnsubscribeError {
                message: e.to_string(),
                timestamp: now_millis(),
            },
        };
        self.reply(reply).await;
    }

    async fn recover(&self, symbols: &[String], since_ms: i64, reason: RecoveryReason) {
        match self
            .state
            .recovery
            .prepare(self.client_id, &self.principal, symbols, since_ms, reason)
        {
            Ok(plan) => {
                let started = plan.started();
                self.reply(ServerMessage::RecoveryStarted {
                    symbols: started.symbols.clone(),
                    estimated_volume: started.estimated_volume,
                    timestamp: now_millis(),
                })
                .await;
                plan.spawn();
            }
            Err(e) => {
                self.reply(ServerMessage::RecoveryError {
                    code: e.kind(),
                    message: e.to_string(),
                    timestamp: now_millis(),
                })
                .await;
            }
        }
    }

    fn info(&self) -> ServerMessage {
        let processor = &self.state.processor;
        ServerMessage::Info {
            client_id: self.client_id,
            version: self.state.version.clone(),
            connected_clients: self.state.connection_count(),
            batch_interval_ms: processor.current_interval_ms(),
            circuit_state: processor.circuit_state(),
            stats: processor.stats(),
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use chrono::Utc;
    use serde_json::json;

    use super::*;

    /// Socket whose send buffer never drains.
    struct StalledSocket;

    impl Sink<Message> for StalledSocket {
        type Error = axum::Error;

        fn poll_ready(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn writer_stops_on_cancel_while_socket_stalled() {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(write_loop(
            StalledSocket,
            rx,
            Duration::from_secs(30),
            cancel.clone(),
        ));

        tx.send(ServerMessage::Pong { timestamp: 1 }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!writer.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(10), writer)
            .await
            .expect("writer should stop without waiting on the socket")
            .unwrap();
    }

    fn frame() -> DataFrame {
        DataFrame {
            symbols: vec!["AAPL".to_string()],
            provider: "alpaca".to_string(),
            capability: CapabilityType::Quotes,
            payload: json!({"bp": 1.0}),
            timestamp: Utc::now(),
            replay: false,
            degraded: false,
        }
    }

    #[test]
    fn sink_reports_full_queue_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ClientSink::new(tx, CancellationToken::new());

        assert_eq!(sink.deliver(&frame()), Ok(()));
        assert_eq!(sink.deliver(&frame()), Err(DeliveryError::QueueFull));

        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Data { .. })));
    }

    #[test]
    fn sink_reports_closed_queue_as_disconnected() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = ClientSink::new(tx, CancellationToken::new());

        assert_eq!(sink.deliver(&frame()), Err(DeliveryError::Disconnected));
    }

    #[test]
    fn closing_sink_cancels_connection() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let sink = ClientSink::new(tx, cancel.clone());

        sink.close();
        assert!(cancel.is_cancelled());
    }
}
