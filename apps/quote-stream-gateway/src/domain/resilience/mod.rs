//! Resilience primitives: exponential backoff and the transform circuit breaker.

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::{BackoffConfig, BackoffPolicy};
pub use circuit_breaker::{
    BreakerCore, BreakerEvent, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot,
    CircuitState,
};
