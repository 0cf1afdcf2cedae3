//! Quote Transformer Port (Driven Port)
//!
//! Converts raw provider events into canonical quotes. The rule selector
//! names the provider/capability rule set to apply.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::streaming::{CanonicalQuote, QuoteEvent};

/// Transform failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    /// The rule set rejected the input.
    #[error("transform failed: {0}")]
    Failed(String),

    /// No rule set matches the selector.
    #[error("no transform rules for {0}")]
    UnknownRules(String),

    /// The collaborator did not answer in time.
    #[error("transform timed out after {0:?}")]
    Timeout(Duration),

    /// The collaborator is unreachable.
    #[error("transform collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Port for the transform collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuoteTransformer: Send + Sync {
    /// Transform a group of events sharing one feed.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] when the group cannot be transformed.
    async fn transform(
        &self,
        rule_selector: &str,
        events: &[QuoteEvent],
    ) -> Result<Vec<CanonicalQuote>, TransformError>;
}
