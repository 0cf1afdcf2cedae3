//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, pipeline status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (not ready while the batch breaker is open)
//! - `GET /health/upstream` - Probes every open upstream capability
//! - `GET /metrics` - Prometheus metrics in text format

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{BatchProcessor, ConnectionPool};
use crate::domain::batching::BatchStats;
use crate::domain::resilience::CircuitState;
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Gateway version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Clients holding a subscription.
    pub clients: usize,
    /// Distinct subscribed symbols.
    pub symbols: usize,
    /// Batch breaker state.
    pub circuit_state: CircuitState,
    /// Current batch interval.
    pub batch_interval_ms: u64,
    /// Pipeline counters.
    pub batch_stats: BatchStats,
    /// Readiness per open upstream feed.
    pub upstream: BTreeMap<String, bool>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Some systems degraded but functional.
    Degraded,
    /// Critical systems unavailable.
    Unhealthy,
}

/// Upstream probe response.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamHealth {
    /// Whether every probed feed answered.
    pub healthy: bool,
    /// Probe result per feed.
    pub feeds: BTreeMap<String, bool>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    registry: Arc<SubscriptionRegistry>,
    processor: Arc<BatchProcessor>,
    pool: Arc<ConnectionPool>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        registry: Arc<SubscriptionRegistry>,
        processor: Arc<BatchProcessor>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            registry,
            processor,
            pool,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by the health server.
#[must_use]
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/health/upstream", get(upstream_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.processor.circuit_state() == CircuitState::Open {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn upstream_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let feeds = state.pool.health_check().await;
    let healthy = feeds.values().all(|alive| *alive);
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(UpstreamHealth { healthy, feeds }))
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let registry = state.registry.stats();
    let circuit_state = state.processor.circuit_state();
    let upstream = state.pool.readiness();

    HealthResponse {
        status: determine_health_status(circuit_state, &upstream),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        clients: registry.client_count,
        symbols: registry.symbol_count,
        circuit_state,
        batch_interval_ms: state.processor.current_interval_ms(),
        batch_stats: state.processor.stats(),
        upstream,
    }
}

fn determine_health_status(
    circuit_state: CircuitState,
    upstream: &BTreeMap<String, bool>,
) -> HealthStatus {
    let ready = upstream.values().filter(|r| **r).count();

    if !upstream.is_empty() && ready == 0 {
        return HealthStatus::Unhealthy;
    }
    if circuit_state != CircuitState::Closed || ready < upstream.len() {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::CapabilityConnector;
    use crate::application::services::test_support::FakeConnector;
    use crate::application::services::{BatchProcessorConfig, PoolConfig};
    use crate::domain::recovery::ReplayWindow;
    use crate::domain::streaming::{CapabilityType, FeedKey};
    use crate::infrastructure::cache::InMemoryQuoteCache;
    use crate::infrastructure::transform::PassthroughTransformer;

    struct Fixture {
        state: Arc<HealthServerState>,
        pool: Arc<ConnectionPool>,
        connector: Arc<FakeConnector>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SubscriptionRegistry::new());
        let processor = BatchProcessor::new(
            BatchProcessorConfig::default(),
            Arc::clone(&registry),
            Arc::new(PassthroughTransformer::new()),
            Arc::new(InMemoryQuoteCache::new()),
            Arc::new(Mutex::new(ReplayWindow::new(Duration::from_secs(60), 10))),
        );
        let connector = Arc::new(FakeConnector::new());
        let (tx, _rx) = mpsc::channel(1);
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&connector) as Arc<dyn CapabilityConnector>,
            tx,
            PoolConfig {
                probe_timeout: Duration::from_millis(50),
                ..PoolConfig::default()
            },
        ));
        let state = Arc::new(HealthServerState::new(
            "test".to_string(),
            registry,
            processor,
            Arc::clone(&pool),
        ));
        Fixture {
            state,
            pool,
            connector,
        }
    }

    async fn get(state: &Arc<HealthServerState>, uri: &str) -> (StatusCode, String) {
        let response = router(Arc::clone(state))
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn determine_status_closed_breaker_no_feeds() {
        let status = determine_health_status(CircuitState::Closed, &BTreeMap::new());
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn determine_status_partial() {
        let upstream = BTreeMap::from([
            ("alpaca/quotes".to_string(), true),
            ("alpaca/trades".to_string(), false),
        ]);
        assert_eq!(
            determine_health_status(CircuitState::Closed, &upstream),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(CircuitState::Open, &BTreeMap::new()),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn determine_status_none_ready() {
        let upstream = BTreeMap::from([("alpaca/quotes".to_string(), false)]);
        assert_eq!(
            determine_health_status(CircuitState::Closed, &upstream),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn health_reports_pipeline_state() {
        let fixture = fixture();
        let (status, body) = get(&fixture.state, "/health").await;

        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["circuitState"], "CLOSED");
        assert_eq!(value["batchIntervalMs"], 50);
        assert_eq!(value["batchStats"]["totalBatches"], 0);
    }

    #[tokio::test]
    async fn liveness_and_readiness() {
        let fixture = fixture();
        assert_eq!(get(&fixture.state, "/healthz").await.0, StatusCode::OK);
        assert_eq!(get(&fixture.state, "/readyz").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn upstream_probe_reports_dead_feeds() {
        let fixture = fixture();
        let feed = FeedKey::new("alpaca", CapabilityType::Quotes);
        fixture.pool.acquire(&feed).await.unwrap();

        let (status, _) = get(&fixture.state, "/health/upstream").await;
        assert_eq!(status, StatusCode::OK);

        fixture.connector.capability(0).alive.store(false, Ordering::SeqCst);
        let (status, body) = get(&fixture.state, "/health/upstream").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("alpaca/quotes"));
    }
}
