//! Frame Sinks
//!
//! The per-client delivery callback held by the registry. Implementations
//! must never block: the registry calls them inline while fanning out a
//! batch.

use std::sync::Arc;

use crate::domain::streaming::DataFrame;

/// Why a frame could not be handed to a client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The client's outbound queue is full; the frame was dropped.
    #[error("client queue full")]
    QueueFull,

    /// The client connection is gone.
    #[error("client connection closed")]
    Disconnected,

    /// The sink refused the frame for another reason.
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

impl DeliveryError {
    /// Whether the failure means the connection is dead.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// Non-blocking delivery callback for one client.
pub trait FrameSink: Send + Sync {
    /// Hand a frame to the client.
    ///
    /// # Errors
    ///
    /// Returns a [`DeliveryError`] when the frame was not accepted.
    fn deliver(&self, frame: &DataFrame) -> Result<(), DeliveryError>;

    /// Ask the owning connection to shut down.
    fn close(&self) {}
}

impl<F> FrameSink for F
where
    F: Fn(&DataFrame) -> Result<(), DeliveryError> + Send + Sync,
{
    fn deliver(&self, frame: &DataFrame) -> Result<(), DeliveryError> {
        self(frame)
    }
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn FrameSink>;
