//! Client WebSocket Gateway
//!
//! Authenticated WebSocket endpoint for downstream clients. Each connection
//! gets a bounded outbound queue registered with the subscription registry
//! as its frame sink.

pub mod protocol;
pub mod server;
pub mod session;

pub use protocol::{ClientMessage, ServerMessage};
pub use server::{GatewayServer, GatewayServerError, router, serve};
pub use session::{ClientSink, GatewayState};
