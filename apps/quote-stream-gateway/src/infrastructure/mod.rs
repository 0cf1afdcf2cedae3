//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the servers and ambient plumbing.

/// Static API key validation for the client handshake.
pub mod auth;

/// In-memory TTL cache for canonical quotes.
pub mod cache;

/// Configuration loading.
pub mod config;

/// Client WebSocket gateway.
pub mod gateway;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Default quote transformer.
pub mod transform;

/// Upstream provider WebSocket sessions.
pub mod upstream;
