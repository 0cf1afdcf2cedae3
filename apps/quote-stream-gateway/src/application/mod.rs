//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Service error taxonomy and wire codes.
pub mod error;

/// Port interfaces for external systems (auth, transform, cache, upstream).
pub mod ports;

/// Application services: pool, subscriptions, batching, recovery.
pub mod services;
