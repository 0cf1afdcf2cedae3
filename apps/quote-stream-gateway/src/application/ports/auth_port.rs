//! Credential Validator Port (Driven Port)
//!
//! Verifies the key/token pair presented during the WebSocket handshake.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;

use crate::domain::streaming::CapabilityType;

/// Key/token pair taken from the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    /// API key.
    pub api_key: String,
    /// API token.
    pub api_token: String,
}

impl ClientCredentials {
    /// Create credentials.
    #[must_use]
    pub fn new(api_key: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_token: api_token.into(),
        }
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("api_key", &self.api_key)
            .field("api_token", &"[REDACTED]")
            .finish()
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// API key the caller authenticated with.
    pub api_key: String,
    /// Capabilities the caller may subscribe to; `None` means all.
    pub capabilities: Option<HashSet<CapabilityType>>,
}

impl Principal {
    /// A principal allowed every capability.
    #[must_use]
    pub fn unrestricted(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            capabilities: None,
        }
    }

    /// Whether the caller may subscribe to `capability`.
    #[must_use]
    pub fn permits(&self, capability: CapabilityType) -> bool {
        self.capabilities
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&capability))
    }
}

/// Authentication failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No credentials were presented.
    #[error("missing API credentials")]
    MissingCredentials,

    /// The pair did not verify.
    #[error("invalid API credentials")]
    InvalidCredentials,

    /// The validator could not be reached.
    #[error("credential validation unavailable: {0}")]
    Unavailable(String),
}

/// Port for verifying client credentials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Verify a credential pair.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when the pair is not accepted.
    async fn validate(&self, credentials: &ClientCredentials) -> Result<Principal, AuthError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_token() {
        let debug = format!("{:?}", ClientCredentials::new("key", "super-secret"));
        assert!(debug.contains("key"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn principal_permissions() {
        let open = Principal::unrestricted("k");
        assert!(open.permits(CapabilityType::OptionTrades));

        let limited = Principal {
            api_key: "k".to_string(),
            capabilities: Some(HashSet::from([CapabilityType::Quotes])),
        };
        assert!(limited.permits(CapabilityType::Quotes));
        assert!(!limited.permits(CapabilityType::Trades));
    }
}
