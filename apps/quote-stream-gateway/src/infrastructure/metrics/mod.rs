//! Prometheus Metrics Module
//!
//! Exposes gateway metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Pipeline**: events in, batches, per-stage latency, retries, fallbacks
//! - **Delivery**: frames sent and dropped
//! - **Clients**: connected clients, subscribed symbols, handshake rejections
//! - **Upstream**: pool acquisitions, upstream errors and reconnects
//! - **Control**: circuit state, current batch interval
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::application::error::ErrorKind;
use crate::domain::batching::{AdjustmentDirection, FallbackReason, Stage};
use crate::domain::resilience::CircuitState;
use crate::domain::streaming::FeedKey;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            #[allow(clippy::expect_used)]
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Pipeline
    describe_counter!(
        "quote_gateway_events_received_total",
        "Upstream events received by provider and capability"
    );
    describe_counter!(
        "quote_gateway_batches_total",
        "Batches processed"
    );
    describe_histogram!(
        "quote_gateway_batch_size",
        "Events per processed batch"
    );
    describe_histogram!(
        "quote_gateway_batch_processing_seconds",
        "Wall time to process one batch"
    );
    describe_histogram!(
        "quote_gateway_stage_seconds",
        "Per-stage latency of sub-group processing"
    );
    describe_counter!(
        "quote_gateway_retries_total",
        "Sub-group retry attempts"
    );
    describe_counter!(
        "quote_gateway_fallbacks_total",
        "Batches routed to fallback by reason"
    );
    describe_counter!(
        "quote_gateway_partial_recoveries_total",
        "Minimal-path events by outcome"
    );
    describe_counter!(
        "quote_gateway_errors_total",
        "Errors by wire code"
    );

    // Delivery
    describe_counter!(
        "quote_gateway_frames_sent_total",
        "Frames accepted by client queues"
    );
    describe_counter!(
        "quote_gateway_frames_dropped_total",
        "Frames dropped on full client queues"
    );

    // Clients
    describe_gauge!(
        "quote_gateway_connected_clients",
        "Open client connections"
    );
    describe_gauge!(
        "quote_gateway_subscribed_symbols",
        "Distinct symbols with at least one subscriber"
    );
    describe_counter!(
        "quote_gateway_handshake_rejections_total",
        "Refused WebSocket handshakes"
    );
    describe_counter!(
        "quote_gateway_recovery_requests_total",
        "Recovery requests by outcome"
    );

    // Upstream
    describe_counter!(
        "quote_gateway_pool_acquisitions_total",
        "Capability acquisitions by outcome"
    );
    describe_counter!(
        "quote_gateway_upstream_errors_total",
        "Upstream errors by provider"
    );
    describe_counter!(
        "quote_gateway_upstream_reconnects_total",
        "Upstream reconnection attempts"
    );

    // Control
    describe_gauge!(
        "quote_gateway_circuit_state",
        "Transform breaker state (0 closed, 1 half-open, 2 open)"
    );
    describe_gauge!(
        "quote_gateway_batch_interval_ms",
        "Current batch flush interval"
    );
    describe_counter!(
        "quote_gateway_interval_adjustments_total",
        "Adaptive interval changes by direction"
    );
}

// =============================================================================
// Label Types
// =============================================================================

/// Outcome label for pool acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOutcome {
    /// A new capability was opened.
    Opened,
    /// An existing capability was reused.
    Reused,
    /// Opening failed.
    Failed,
}

impl PoolOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Reused => "reused",
            Self::Failed => "failed",
        }
    }
}

/// Outcome label for recovery requests and partial recoveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted or delivered.
    Success,
    /// Rejected or failed.
    Failure,
}

impl Outcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

fn as_count(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an upstream event.
pub fn record_event_received(feed: &FeedKey) {
    counter!(
        "quote_gateway_events_received_total",
        "provider" => feed.provider.clone(),
        "capability" => feed.capability.as_str()
    )
    .increment(1);
}

/// Record a processed batch.
pub fn record_batch(events: usize, duration: Duration) {
    counter!("quote_gateway_batches_total").increment(1);
    #[allow(clippy::cast_precision_loss)]
    let size = events as f64;
    histogram!("quote_gateway_batch_size").record(size);
    histogram!("quote_gateway_batch_processing_seconds").record(duration.as_secs_f64());
}

/// Record one stage of sub-group processing.
pub fn record_stage_latency(stage: Stage, duration: Duration) {
    histogram!(
        "quote_gateway_stage_seconds",
        "stage" => stage.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Record a sub-group retry.
pub fn record_retry(feed: &FeedKey) {
    counter!(
        "quote_gateway_retries_total",
        "provider" => feed.provider.clone(),
        "capability" => feed.capability.as_str()
    )
    .increment(1);
}

/// Record a batch routed to fallback.
pub fn record_fallback(reason: &FallbackReason) {
    counter!(
        "quote_gateway_fallbacks_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record minimal-path outcomes.
pub fn record_partial_recovery(outcome: Outcome, count: usize) {
    counter!(
        "quote_gateway_partial_recoveries_total",
        "outcome" => outcome.as_str()
    )
    .increment(as_count(count));
}

/// Record an error by wire code.
pub fn record_error(kind: ErrorKind) {
    counter!(
        "quote_gateway_errors_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record frames accepted by client queues.
pub fn record_frames_sent(count: usize) {
    counter!("quote_gateway_frames_sent_total").increment(as_count(count));
}

/// Record frames dropped on full client queues.
pub fn record_frames_dropped(count: usize) {
    counter!("quote_gateway_frames_dropped_total").increment(as_count(count));
}

/// Update the connected client count.
pub fn set_connected_clients(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    let value = count as f64;
    gauge!("quote_gateway_connected_clients").set(value);
}

/// Update the subscribed symbol count.
pub fn set_subscribed_symbols(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    let value = count as f64;
    gauge!("quote_gateway_subscribed_symbols").set(value);
}

/// Record a refused handshake.
pub fn record_handshake_rejection(reason: &'static str) {
    counter!(
        "quote_gateway_handshake_rejections_total",
        "reason" => reason
    )
    .increment(1);
}

/// Record a recovery request.
pub fn record_recovery_request(outcome: Outcome) {
    counter!(
        "quote_gateway_recovery_requests_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record a pool acquisition.
pub fn record_pool_acquisition(feed: &FeedKey, outcome: PoolOutcome) {
    counter!(
        "quote_gateway_pool_acquisitions_total",
        "provider" => feed.provider.clone(),
        "capability" => feed.capability.as_str(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record an upstream error.
pub fn record_upstream_error(provider: &str, error_type: &str) {
    counter!(
        "quote_gateway_upstream_errors_total",
        "provider" => provider.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_upstream_reconnect(provider: &str) {
    counter!(
        "quote_gateway_upstream_reconnects_total",
        "provider" => provider.to_string()
    )
    .increment(1);
}

/// Update the breaker state gauge.
pub fn set_circuit_state(state: CircuitState) {
    gauge!("quote_gateway_circuit_state").set(state.as_gauge());
}

/// Update the batch interval gauge.
pub fn set_batch_interval(interval: Duration) {
    gauge!("quote_gateway_batch_interval_ms").set(interval.as_secs_f64() * 1_000.0);
}

/// Record an adaptive interval change.
pub fn record_interval_adjustment(direction: AdjustmentDirection) {
    counter!(
        "quote_gateway_interval_adjustments_total",
        "direction" => direction.as_str()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
