#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Quote Stream Gateway - Adaptive Market Quote Fan-out
//!
//! A WebSocket gateway that keeps one upstream connection per
//! (provider, capability), batches the quote events it receives under an
//! adaptive time window, and fans each canonical quote out to exactly the
//! clients subscribed to its symbol.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Core types and pure state machines
//!   - `streaming`: Feed keys, quote events, data frames
//!   - `subscription`: Subscription registry and frame sinks
//!   - `batching`: Batch buffer, adaptive interval, fallback policy
//!   - `resilience`: Backoff and circuit breaker
//!   - `recovery`: Replay requests and the recent-frame window
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Credential validator, transformer, cache, upstream capability
//!   - `services`: Connection pool, subscriptions, batch processor, recovery
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `gateway`: Client WebSocket server
//!   - `upstream`: Provider WebSocket sessions
//!   - `auth`, `cache`, `transform`: Default port implementations
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! Provider WS ──┐
//!               │    ┌──────────┐    ┌───────────┐    ┌──────────┐
//!               ├───►│  Batch   │───►│ Transform │───►│ Registry │──► Client 1
//! Provider WS ──┤    │  Window  │    │  + Cache  │    │ fan-out  │──► Client 2
//!               │    └──────────┘    └───────────┘    └──────────┘──► Client N
//! Provider WS ──┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{CapabilityType, ClientId, DataFrame, FeedKey, QuoteEvent, Symbol};
pub use domain::subscription::{SubscriptionRegistry, SubscriptionSnapshot};

// Application services
pub use application::error::{ErrorKind, ServiceError};
pub use application::services::{
    BatchProcessor, BatchProcessorConfig, ConnectionPool, PoolConfig, RecoveryWorker,
    SubscriptionLimits, SubscriptionService,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, GatewayConfig};

// Servers
pub use infrastructure::gateway::{GatewayServer, GatewayServerError, GatewayState};
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
