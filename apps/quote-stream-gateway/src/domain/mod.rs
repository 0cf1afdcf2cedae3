//! Domain Layer - Core streaming types and business logic.
//!
//! Pure types and state machines with no I/O: quote events and frames, the
//! subscription registry, batching primitives, resilience policies and the
//! replay window.

/// Batch buffering, adaptive interval, fallback and counters.
pub mod batching;

/// Replay requests and the replay window.
pub mod recovery;

/// Backoff and circuit breaking.
pub mod resilience;

/// Market data streaming types (events, canonical quotes, frames).
pub mod streaming;

/// Subscription tracking and fan-out.
pub mod subscription;
