//! Upstream Capability Port (Driven Port)
//!
//! An open handle to one provider feed, and the connector that opens them.
//! Events received on a capability are pushed into the sender handed to
//! [`CapabilityConnector::open`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::domain::streaming::{FeedKey, QuoteEvent, Symbol};

/// Lifecycle state of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    /// Connecting for the first time.
    Connecting,
    /// Connected and accepting subscriptions.
    Ready,
    /// Lost the connection, trying again.
    Reconnecting,
    /// Closed on request.
    Closed,
    /// Gave up.
    Failed,
}

impl CapabilityStatus {
    /// Label value for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CapabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// No endpoint configured for the provider.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// The capability did not become ready in time.
    #[error("capability not ready after {0:?}")]
    ReadyTimeout(Duration),

    /// A subscribe or unsubscribe request failed.
    #[error("subscription request failed: {0}")]
    RequestFailed(String),

    /// The handle is closed.
    #[error("capability closed")]
    Closed,

    /// The upstream reported an error.
    #[error("upstream error {code}: {message}")]
    Upstream {
        /// Provider error code.
        code: i32,
        /// Provider message.
        message: String,
    },
}

/// Callback for status transitions.
pub type StatusCallback = Box<dyn Fn(CapabilityStatus) + Send + Sync>;

/// Callback for asynchronous upstream errors.
pub type ErrorCallback = Box<dyn Fn(&UpstreamError) + Send + Sync>;

/// An open upstream feed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamCapability: Send + Sync {
    /// Feed this handle serves.
    fn feed(&self) -> FeedKey;

    /// Whether the handle is connected and accepting subscriptions.
    fn is_ready(&self) -> bool;

    /// Add symbols upstream.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] if the request fails.
    async fn subscribe(&self, symbols: &[Symbol]) -> Result<(), UpstreamError>;

    /// Remove symbols upstream.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] if the request fails.
    async fn unsubscribe(&self, symbols: &[Symbol]) -> Result<(), UpstreamError>;

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] if the handle is not alive.
    async fn ping(&self) -> Result<(), UpstreamError>;

    /// Close the handle.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] if shutdown was not clean.
    async fn close(&self) -> Result<(), UpstreamError>;

    /// Register a status callback.
    fn on_status_change(&self, callback: StatusCallback);

    /// Register an error callback.
    fn on_error(&self, callback: ErrorCallback);
}

/// Opens capabilities.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CapabilityConnector: Send + Sync {
    /// Open a handle for `feed` that pushes events into `events`.
    ///
    /// The returned handle may still be connecting.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] if the feed cannot be opened at all.
    async fn open(
        &self,
        feed: &FeedKey,
        events: mpsc::Sender<QuoteEvent>,
    ) -> Result<Arc<dyn UpstreamCapability>, UpstreamError>;
}
