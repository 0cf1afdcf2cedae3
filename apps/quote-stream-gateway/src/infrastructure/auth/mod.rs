//! Static Credential Validator
//!
//! Verifies handshake credentials against the API keys loaded from
//! configuration. Tokens are compared in constant time per key.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::application::ports::{AuthError, ClientCredentials, CredentialValidator, Principal};
use crate::infrastructure::config::ApiKeyEntry;

/// Validator backed by a fixed key table.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialValidator {
    keys: HashMap<String, ApiKeyEntry>,
}

impl StaticCredentialValidator {
    /// Build from configured entries. A repeated key keeps its last entry.
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = ApiKeyEntry>) -> Self {
        let keys = entries
            .into_iter()
            .map(|entry| (entry.credentials.api_key.clone(), entry))
            .collect();
        Self { keys }
    }

    /// Number of configured keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl CredentialValidator for StaticCredentialValidator {
    async fn validate(&self, credentials: &ClientCredentials) -> Result<Principal, AuthError> {
        if credentials.api_key.is_empty() || credentials.api_token.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let entry = self
            .keys
            .get(&credentials.api_key)
            .ok_or(AuthError::InvalidCredentials)?;

        if !constant_time_eq(
            entry.credentials.api_token.as_bytes(),
            credentials.api_token.as_bytes(),
        ) {
            return Err(AuthError::InvalidCredentials);
        }

        Ok(Principal {
            api_key: credentials.api_key.clone(),
            capabilities: entry.capabilities.clone(),
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
