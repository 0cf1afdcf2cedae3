//! Quote Stream Gateway Binary
//!
//! Starts the quote streaming gateway.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin quote-stream-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `QUOTE_GATEWAY_API_KEYS`: Accepted client keys (`key:token[:cap|cap],...`)
//!
//! ## Optional
//! - `QUOTE_GATEWAY_UPSTREAMS`: Provider endpoints (`provider[.capability]=url,...`)
//! - `QUOTE_GATEWAY_WS_PORT`: Client WebSocket port (default: 8090)
//! - `QUOTE_GATEWAY_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `QUOTE_GATEWAY_BATCH_INTERVAL_MS`: Initial batch window (default: 50)
//! - `QUOTE_GATEWAY_DYNAMIC_BATCHING`: Enable interval tuning (default: false)
//! - `QUOTE_GATEWAY_UPSTREAM_CREDENTIALS`: Provider credentials (`provider=key:secret,...`)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `RUST_LOG`: Log level (default: info)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use quote_stream_gateway::application::ports::{CapabilityConnector, CredentialValidator};
use quote_stream_gateway::application::services::SharedReplayWindow;
use quote_stream_gateway::domain::recovery::ReplayWindow;
use quote_stream_gateway::infrastructure::auth::StaticCredentialValidator;
use quote_stream_gateway::infrastructure::cache::InMemoryQuoteCache;
use quote_stream_gateway::infrastructure::gateway;
use quote_stream_gateway::infrastructure::health::{HealthServer, HealthServerState};
use quote_stream_gateway::infrastructure::telemetry;
use quote_stream_gateway::infrastructure::transform::PassthroughTransformer;
use quote_stream_gateway::infrastructure::upstream::WsCapabilityConnector;
use quote_stream_gateway::{
    BatchProcessor, ConnectionPool, GatewayConfig, GatewayState, RecoveryWorker,
    SubscriptionRegistry, SubscriptionService, init_metrics,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upstream events buffered ahead of the batch collector.
const EVENT_QUEUE_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Quote Stream Gateway");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = GatewayConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let version = env!("CARGO_PKG_VERSION").to_string();

    // Core state
    let registry = Arc::new(SubscriptionRegistry::new());
    let replay: SharedReplayWindow = Arc::new(Mutex::new(ReplayWindow::new(
        config.recovery.replay_retention,
        config.recovery.replay_max_frames,
    )));
    let cache = Arc::new(InMemoryQuoteCache::new());

    // Batch pipeline
    let processor = BatchProcessor::new(
        config.batch.clone(),
        Arc::clone(&registry),
        Arc::new(PassthroughTransformer::new()),
        Arc::clone(&cache) as _,
        Arc::clone(&replay),
    );
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let processor_tasks = processor.start(events_rx, shutdown_token.clone());

    // Upstream pool and services
    let connector: Arc<dyn CapabilityConnector> = Arc::new(WsCapabilityConnector::new(
        config.upstream.clone(),
        shutdown_token.child_token(),
    ));
    let pool = Arc::new(ConnectionPool::new(connector, events_tx, config.pool));
    let subscriptions = Arc::new(SubscriptionService::new(
        Arc::clone(&registry),
        Arc::clone(&pool),
        config.subscriptions.clone(),
    ));
    let recovery = Arc::new(RecoveryWorker::new(
        Arc::clone(&registry),
        Arc::clone(&replay),
        config.recovery.window,
    ));
    let validator: Arc<dyn CredentialValidator> =
        Arc::new(StaticCredentialValidator::new(config.api_keys.clone()));

    // Idle client eviction
    tokio::spawn(Arc::clone(&subscriptions).run_idle_sweeper(
        config.idle.sweep_interval,
        config.idle.timeout,
        shutdown_token.clone(),
    ));

    // Expired cache entries
    tokio::spawn(run_cache_cleanup(
        Arc::clone(&cache),
        config.batch.cache_ttl,
        shutdown_token.clone(),
    ));

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        version.clone(),
        Arc::clone(&registry),
        Arc::clone(&processor),
        Arc::clone(&pool),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Client gateway; a bind failure aborts startup
    let gateway_addr = SocketAddr::from(([0, 0, 0, 0], config.server.ws_port));
    let listener = TcpListener::bind(gateway_addr)
        .await
        .with_context(|| format!("failed to bind gateway port {}", config.server.ws_port))?;
    let gateway_state = Arc::new(GatewayState::new(
        subscriptions,
        recovery,
        Arc::clone(&processor),
        validator,
        version,
        config.server.client_queue_capacity,
        config.server.client_ping_interval,
        shutdown_token.clone(),
    ));
    let gateway_task = tokio::spawn(gateway::serve(
        listener,
        gateway_state,
        shutdown_token.clone(),
    ));

    tracing::info!("Quote gateway ready");

    await_shutdown(shutdown_token).await;

    let drained = tokio::time::timeout(config.server.shutdown_timeout, async {
        match gateway_task.await {
            Ok(Err(e)) => tracing::error!(error = %e, "Gateway server error"),
            Err(e) => tracing::error!(error = %e, "Gateway task failed"),
            Ok(Ok(())) => {}
        }
        pool.close_all().await;
        processor_tasks.join().await;
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            timeout_secs = config.server.shutdown_timeout.as_secs(),
            "Graceful shutdown timed out"
        );
    }

    tracing::info!("Quote gateway stopped");
    Ok(())
}

/// Periodically drop expired cache entries.
async fn run_cache_cleanup(
    cache: Arc<InMemoryQuoteCache>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let removed = cache.cleanup_expired();
                if removed > 0 {
                    tracing::debug!(removed, "Expired cache entries removed");
                }
            }
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        ws_port = config.server.ws_port,
        health_port = config.server.health_port,
        api_keys = config.api_keys.len(),
        batch_interval_ms = u64::try_from(config.batch.adaptive.initial_interval.as_millis())
            .unwrap_or(u64::MAX),
        dynamic_batching = config.batch.adaptive.enabled,
        max_retry_attempts = config.batch.max_retry_attempts,
        idle_timeout_secs = config.idle.timeout.as_secs(),
        recovery_window_secs = config.recovery.window.as_secs(),
        "Configuration loaded"
    );
    tracing::debug!(
        endpoints = ?config.upstream.endpoints,
        default_provider = %config.subscriptions.default_provider,
        "Upstream endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!("Graceful shutdown started");
}
