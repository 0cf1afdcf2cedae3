//! Configuration Module
//!
//! Environment-driven configuration for the gateway.

mod settings;

pub use settings::{
    ApiKeyEntry, ConfigError, Credentials, GatewayConfig, IdleSettings, RecoverySettings,
    ServerSettings, UpstreamSettings, WebSocketSettings,
};
