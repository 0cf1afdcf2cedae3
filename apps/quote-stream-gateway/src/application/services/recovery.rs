//! Recovery Worker
//!
//! Serves "resend since T" requests from the in-memory replay window. The
//! request is validated and acknowledged synchronously; frames follow on a
//! spawned task through the same per-client sink live broadcasts use.
//!
//! A client can only replay symbols it currently holds, on the feed it is
//! bound to.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::application::error::ServiceError;
use crate::application::ports::Principal;
use crate::domain::recovery::{RecoveryError, RecoveryReason, RecoveryRequest, ReplayWindow};
use crate::domain::streaming::{ClientId, DataFrame, FeedKey, Symbol};
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::metrics::{self, Outcome};

/// Replay window shared by the batch processor (writer) and recovery (reader).
pub type SharedReplayWindow = Arc<Mutex<ReplayWindow>>;

/// Frames sent between cooperative yields.
const REPLAY_YIELD_EVERY: usize = 256;

/// Accepted recovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryStarted {
    /// Normalized symbols being replayed.
    pub symbols: Vec<Symbol>,
    /// Frames the window held for the request when it was accepted.
    pub estimated_volume: usize,
}

/// Replays recent frames to reconnecting clients.
pub struct RecoveryWorker {
    registry: Arc<SubscriptionRegistry>,
    replay: SharedReplayWindow,
    window: Duration,
}

impl RecoveryWorker {
    /// Create a worker accepting requests up to `window` old.
    #[must_use]
    pub const fn new(
        registry: Arc<SubscriptionRegistry>,
        replay: SharedReplayWindow,
        window: Duration,
    ) -> Self {
        Self {
            registry,
            replay,
            window,
        }
    }

    /// Validate a request and collect its frames without sending them.
    ///
    /// The caller acknowledges the request, then starts the replay with
    /// [`ReplayPlan::spawn`].
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Recovery`] for requests outside the window,
    /// without symbols, for symbols the client does not hold, or for a feed
    /// the principal may not read. Nothing is collected in that case.
    pub fn prepare(
        &self,
        client_id: ClientId,
        principal: &Principal,
        symbols: &[String],
        since_ms: i64,
        reason: RecoveryReason,
    ) -> Result<ReplayPlan, ServiceError> {
        let result = self.collect(client_id, principal, symbols, since_ms, reason);
        match &result {
            Ok(plan) => {
                metrics::record_recovery_request(Outcome::Success);
                tracing::info!(
                    client_id,
                    reason = reason.as_str(),
                    symbols = plan.started.symbols.len(),
                    estimated_volume = plan.started.estimated_volume,
                    "Recovery started"
                );
            }
            Err(e) => {
                metrics::record_recovery_request(Outcome::Failure);
                metrics::record_error(e.kind());
                tracing::debug!(client_id, reason = reason.as_str(), error = %e, "Recovery rejected");
            }
        }
        result
    }

    fn collect(
        &self,
        client_id: ClientId,
        principal: &Principal,
        symbols: &[String],
        since_ms: i64,
        reason: RecoveryReason,
    ) -> Result<ReplayPlan, ServiceError> {
        let normalized = normalize(symbols);
        let request = RecoveryRequest::from_millis(client_id, normalized, since_ms, reason)?;
        let now = Utc::now();
        request.validate(now, self.window)?;

        let Some(subscription) = self.registry.get_subscription(client_id) else {
            return Err(RecoveryError::NotSubscribed(request.symbols).into());
        };
        let feed = FeedKey::new(subscription.provider, subscription.capability_type);
        if !principal.permits(feed.capability) {
            return Err(RecoveryError::NotPermitted(feed.capability).into());
        }
        let held: HashSet<&Symbol> = subscription.symbols.iter().collect();
        let missing: Vec<Symbol> = request
            .symbols
            .iter()
            .filter(|symbol| !held.contains(symbol))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(RecoveryError::NotSubscribed(missing).into());
        }

        let wanted: HashSet<Symbol> = request.symbols.iter().cloned().collect();
        let frames = {
            let mut window = self.replay.lock();
            window.prune(now);
            window.frames_since(&feed, &wanted, request.since)
        };

        Ok(ReplayPlan {
            client_id,
            started: RecoveryStarted {
                symbols: request.symbols,
                estimated_volume: frames.len(),
            },
            frames,
            registry: Arc::clone(&self.registry),
        })
    }
}

/// A validated request with its frames, not yet sent.
pub struct ReplayPlan {
    client_id: ClientId,
    started: RecoveryStarted,
    frames: Vec<DataFrame>,
    registry: Arc<SubscriptionRegistry>,
}

impl ReplayPlan {
    /// What the client is told.
    #[must_use]
    pub const fn started(&self) -> &RecoveryStarted {
        &self.started
    }

    /// Send the frames on a background task through the client's sink.
    pub fn spawn(self) -> JoinHandle<()> {
        let Self {
            client_id,
            frames,
            registry,
            ..
        } = self;

        tokio::spawn(async move {
            let mut sent = 0usize;
            for frame in frames {
                match registry.send_to(client_id, &frame) {
                    Ok(()) => sent += 1,
                    Err(e) if e.is_fatal() => {
                        tracing::debug!(client_id, sent, error = %e, "Replay stopped");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(client_id, error = %e, "Replay frame dropped");
                        metrics::record_frames_dropped(1);
                    }
                }
                if sent % REPLAY_YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
            }
            metrics::record_frames_sent(sent);
            tracing::debug!(client_id, sent, "Replay finished");
        })
    }
}

fn normalize(symbols: &[String]) -> Vec<Symbol> {
    let mut seen = HashSet::new();
    symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::error::ErrorKind;
    use crate::domain::streaming::{CanonicalQuote, CapabilityType, DataFrame, FeedKey};
    use crate::domain::subscription::{DeliveryError, SharedSink};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn frame(symbol: &str, seconds_ago: i64) -> DataFrame {
        DataFrame::from_canonical(&CanonicalQuote {
            symbol: symbol.to_string(),
            provider: "alpaca".to_string(),
            capability: CapabilityType::Quotes,
            payload: json!({"bp": 1.0}),
            timestamp: Utc::now() - chrono::Duration::seconds(seconds_ago),
        })
    }

    fn setup() -> (RecoveryWorker, mpsc::UnboundedReceiver<DataFrame>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: SharedSink = Arc::new(move |f: &DataFrame| -> Result<(), DeliveryError> {
            tx.send(f.clone()).map_err(|_| DeliveryError::Disconnected)
        });
        registry
            .add_subscription(
                1,
                &["AAPL".to_string()],
                FeedKey::new("alpaca", CapabilityType::Quotes),
                sink,
            )
            .unwrap();

        let replay: SharedReplayWindow =
            Arc::new(Mutex::new(ReplayWindow::new(Duration::from_secs(600), 100)));
        {
            let mut window = replay.lock();
            let now = Utc::now();
            window.record(frame("AAPL", 120), now);
            window.record(frame("MSFT", 60), now);
            window.record(frame("AAPL", 30), now);
        }
        (RecoveryWorker::new(registry, replay, DAY), rx)
    }

    fn millis_ago(duration: chrono::Duration) -> i64 {
        (Utc::now() - duration).timestamp_millis()
    }

    fn anyone() -> Principal {
        Principal::unrestricted("k")
    }

    #[tokio::test]
    async fn replays_matching_frames_tagged_as_replay() {
        let (worker, mut rx) = setup();
        let since = millis_ago(chrono::Duration::seconds(90));

        let plan = worker
            .prepare(1, &anyone(), &["aapl".to_string()], since, RecoveryReason::Reconnect)
            .unwrap();
        let started = plan.started().clone();
        plan.spawn().await.unwrap();

        assert_eq!(started.symbols, vec!["AAPL".to_string()]);
        assert_eq!(started.estimated_volume, 1);
        let replayed = rx.try_recv().unwrap();
        assert!(replayed.replay);
        assert!(replayed.contains_symbol("AAPL"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejects_requests_older_than_window() {
        let (worker, mut rx) = setup();
        let since = millis_ago(chrono::Duration::hours(25));

        let err = worker
            .prepare(1, &anyone(), &["AAPL".to_string()], since, RecoveryReason::Gap)
            .err()
            .unwrap();

        assert_eq!(err.kind(), ErrorKind::RecoveryWindowExceeded);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejects_future_timestamps_and_empty_symbols() {
        let (worker, _rx) = setup();
        let future = (Utc::now() + chrono::Duration::minutes(5)).timestamp_millis();

        let err = worker
            .prepare(1, &anyone(), &["AAPL".to_string()], future, RecoveryReason::Manual)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = worker
            .prepare(1, &anyone(), &[" ".to_string()], 0, RecoveryReason::Manual)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn rejects_symbols_the_client_does_not_hold() {
        let (worker, mut rx) = setup();
        let since = millis_ago(chrono::Duration::minutes(5));

        let err = worker
            .prepare(
                1,
                &anyone(),
                &["AAPL".to_string(), "MSFT".to_string()],
                since,
                RecoveryReason::Gap,
            )
            .err()
            .unwrap();

        assert!(matches!(
            err,
            ServiceError::Recovery(RecoveryError::NotSubscribed(ref missing)) if *missing == ["MSFT"]
        ));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_client_is_rejected() {
        let (worker, _rx) = setup();
        let since = millis_ago(chrono::Duration::minutes(5));

        let err = worker
            .prepare(99, &anyone(), &["AAPL".to_string()], since, RecoveryReason::Reconnect)
            .err()
            .unwrap();

        assert!(matches!(
            err,
            ServiceError::Recovery(RecoveryError::NotSubscribed(_))
        ));
    }

    #[tokio::test]
    async fn rejects_feed_outside_principal_capabilities() {
        let (worker, mut rx) = setup();
        let trades_only = Principal {
            api_key: "k".to_string(),
            capabilities: Some(HashSet::from([CapabilityType::Trades])),
        };
        let since = millis_ago(chrono::Duration::minutes(5));

        let err = worker
            .prepare(1, &trades_only, &["AAPL".to_string()], since, RecoveryReason::Manual)
            .err()
            .unwrap();

        assert_eq!(
            err.to_string(),
            RecoveryError::NotPermitted(CapabilityType::Quotes).to_string()
        );
        assert!(rx.try_recv().is_err());
    }
}
