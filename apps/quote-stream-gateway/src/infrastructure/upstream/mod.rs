//! Upstream Provider Adapters
//!
//! WebSocket sessions to market data providers, one per
//! (provider, capability), opened on demand by the connection pool.

pub mod capability;
pub mod codec;
pub mod heartbeat;

pub use capability::{WsCapability, WsCapabilityConnector};
pub use codec::{CodecError, SubscriptionAction, UpstreamFrame};
pub use heartbeat::{Heartbeat, HeartbeatAction, HeartbeatConfig};
