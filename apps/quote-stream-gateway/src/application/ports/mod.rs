//! Port Interfaces
//!
//! Contracts the infrastructure adapters implement, following the
//! Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `CredentialValidator`: verifies handshake credentials
//! - `QuoteTransformer`: raw events to canonical quotes
//! - `QuoteCache`: latest-quote store
//! - `CapabilityConnector` / `UpstreamCapability`: provider feeds

mod auth_port;
mod cache_port;
mod capability_port;
mod transform_port;

#[cfg(test)]
pub use auth_port::MockCredentialValidator;
pub use auth_port::{AuthError, ClientCredentials, CredentialValidator, Principal};
#[cfg(test)]
pub use cache_port::MockQuoteCache;
pub use cache_port::{CacheError, QuoteCache, quote_cache_key};
#[cfg(test)]
pub use capability_port::{MockCapabilityConnector, MockUpstreamCapability};
pub use capability_port::{
    CapabilityConnector, CapabilityStatus, ErrorCallback, StatusCallback, UpstreamCapability,
    UpstreamError,
};
#[cfg(test)]
pub use transform_port::MockQuoteTransformer;
pub use transform_port::{QuoteTransformer, TransformError};
