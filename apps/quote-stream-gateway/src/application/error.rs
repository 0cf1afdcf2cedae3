//! Gateway error taxonomy.
//!
//! Every failure a client or operator can observe maps onto one
//! [`ErrorKind`] with a stable wire code, used in error frames and as the
//! `kind` metric label.
//!
//! | Code | Surfaced as | Connection |
//! |------|-------------|------------|
//! | `authentication` | HTTP 401 on upgrade | refused |
//! | `validation` | `subscribe-error` / `error` frame | stays open |
//! | `upstream_unavailable` | `subscribe-error` frame, metrics | stays open |
//! | `transform_failure` | metrics only (batch retried, then fallback) | n/a |
//! | `circuit_open` | metrics only (batch sent to fallback) | n/a |
//! | `recovery_window_exceeded` | `recovery-error` frame | stays open |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::ports::{AuthError, UpstreamError};
use crate::domain::recovery::RecoveryError;
use crate::domain::subscription::RegistryError;

/// Stable error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Handshake credentials rejected.
    Authentication,
    /// Malformed or disallowed client request.
    Validation,
    /// Upstream feed could not be opened or changed.
    UpstreamUnavailable,
    /// Transform collaborator failed a batch.
    TransformFailure,
    /// Breaker open; batch sent straight to fallback.
    CircuitOpen,
    /// Recovery request outside the replay window.
    RecoveryWindowExceeded,
}

impl ErrorKind {
    /// Wire code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Validation => "validation",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::TransformFailure => "transform_failure",
            Self::CircuitOpen => "circuit_open",
            Self::RecoveryWindowExceeded => "recovery_window_exceeded",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by application services to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Credentials rejected.
    #[error(transparent)]
    Authentication(#[from] AuthError),

    /// Request failed validation.
    #[error("{0}")]
    Validation(String),

    /// Upstream change failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Recovery request rejected.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

impl ServiceError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Upstream(_) => ErrorKind::UpstreamUnavailable,
            Self::Recovery(RecoveryError::WindowExceeded { .. }) => {
                ErrorKind::RecoveryWindowExceeded
            }
            Self::Recovery(_) => ErrorKind::Validation,
        }
    }
}

impl From<RegistryError> for ServiceError {
    fn from(err: RegistryError) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(ErrorKind::Authentication, "authentication")]
    #[test_case(ErrorKind::Validation, "validation")]
    #[test_case(ErrorKind::UpstreamUnavailable, "upstream_unavailable")]
    #[test_case(ErrorKind::TransformFailure, "transform_failure")]
    #[test_case(ErrorKind::CircuitOpen, "circuit_open")]
    #[test_case(ErrorKind::RecoveryWindowExceeded, "recovery_window_exceeded")]
    fn wire_codes_match_serde(kind: ErrorKind, code: &str) {
        assert_eq!(kind.as_str(), code);
        assert_eq!(serde_json::to_value(kind).unwrap(), code);
    }

    #[test]
    fn recovery_errors_classify() {
        let exceeded = ServiceError::from(RecoveryError::WindowExceeded {
            age_ms: 90_000_000,
            window_ms: 86_400_000,
        });
        assert_eq!(exceeded.kind(), ErrorKind::RecoveryWindowExceeded);
        assert_eq!(
            ServiceError::from(RecoveryError::FutureTimestamp).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn upstream_errors_classify() {
        let err = ServiceError::from(UpstreamError::Closed);
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    }
}
