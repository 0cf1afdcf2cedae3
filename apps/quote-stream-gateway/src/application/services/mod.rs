//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `ConnectionPool`: one shared upstream capability per feed
//! - `SubscriptionService`: registry changes mirrored onto the pool
//! - `BatchProcessor`: buffering, transform, fan-out, fallback
//! - `RecoveryWorker`: replay from the recent-frame window

pub mod batch_processor;
pub mod connection_pool;
pub mod recovery;
pub mod subscription;

#[cfg(test)]
pub(crate) mod test_support;

pub use batch_processor::{BatchProcessor, BatchProcessorConfig, BatchProcessorTasks};
pub use connection_pool::{CapabilityRef, ConnectionPool, PoolConfig};
pub use recovery::{RecoveryStarted, RecoveryWorker, ReplayPlan, SharedReplayWindow};
pub use subscription::{SubscribeRequest, SubscriptionLimits, SubscriptionService};
