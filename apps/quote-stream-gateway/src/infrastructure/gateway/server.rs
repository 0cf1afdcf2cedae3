//! Gateway HTTP Server
//!
//! Serves `GET /ws`. Credentials are checked before the upgrade; a refused
//! handshake gets a plain HTTP error and never becomes a session.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::session::{GatewayState, run_session};
use crate::application::error::ErrorKind;
use crate::application::ports::{AuthError, ClientCredentials};
use crate::infrastructure::metrics;

const API_KEY_HEADER: &str = "x-api-key";
const API_TOKEN_HEADER: &str = "x-api-token";

/// Credentials accepted as query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeParams {
    key: Option<String>,
    token: Option<String>,
}

/// Client WebSocket server.
pub struct GatewayServer {
    port: u16,
    state: Arc<GatewayState>,
    cancel: CancellationToken,
}

impl GatewayServer {
    /// Create a server for `port`.
    #[must_use]
    pub const fn new(port: u16, state: Arc<GatewayState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `GatewayServerError` if binding fails or the server stops
    /// with an error.
    pub async fn run(self) -> Result<(), GatewayServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayServerError::BindFailed(self.port, e.to_string()))?;

        serve(listener, self.state, self.cancel).await
    }
}

/// Serve the gateway on an already bound listener until cancelled.
///
/// # Errors
///
/// Returns `GatewayServerError::ServerFailed` if the server stops with an
/// error.
pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    cancel: CancellationToken,
) -> Result<(), GatewayServerError> {
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    tracing::info!(port, "Gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| GatewayServerError::ServerFailed(e.to_string()))?;

    tracing::info!("Gateway stopped");
    Ok(())
}

/// Routes served by the gateway.
#[must_use]
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(params): Query<HandshakeParams>,
) -> Response {
    let credentials = credentials_from(&headers, params);

    match state.validator.validate(&credentials).await {
        Ok(principal) => ws
            .on_upgrade(move |socket| run_session(socket, state, principal))
            .into_response(),
        Err(e) => {
            tracing::info!(api_key = %credentials.api_key, error = %e, "Handshake refused");
            metrics::record_handshake_rejection(rejection_reason(&e));
            metrics::record_error(ErrorKind::Authentication);
            rejection_response(&e)
        }
    }
}

/// Headers win over query parameters; absent values become empty strings.
fn credentials_from(headers: &HeaderMap, params: HandshakeParams) -> ClientCredentials {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    ClientCredentials::new(
        header(API_KEY_HEADER).or(params.key).unwrap_or_default(),
        header(API_TOKEN_HEADER).or(params.token).unwrap_or_default(),
    )
}

const fn rejection_reason(error: &AuthError) -> &'static str {
    match error {
        AuthError::MissingCredentials => "missing_credentials",
        AuthError::InvalidCredentials => "invalid_credentials",
        AuthError::Unavailable(_) => "validator_unavailable",
    }
}

fn rejection_response(error: &AuthError) -> Response {
    let status = match error {
        AuthError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AuthError::MissingCredentials | AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
    };
    let body = serde_json::json!({
        "code": ErrorKind::Authentication,
        "message": error.to_string(),
    });
    (status, Json(body)).into_response()
}

// =============================================================================
// Errors
// =============================================================================

/// Gateway server errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn headers_take_precedence_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("header-key"));
        headers.insert(API_TOKEN_HEADER, HeaderValue::from_static("header-token"));
        let params = HandshakeParams {
            key: Some("query-key".to_string()),
            token: Some("query-token".to_string()),
        };

        let creds = credentials_from(&headers, params);
        assert_eq!(creds, ClientCredentials::new("header-key", "header-token"));
    }

    #[test]
    fn query_parameters_fill_missing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("header-key"));
        let params = HandshakeParams {
            key: None,
            token: Some("query-token".to_string()),
        };

        let creds = credentials_from(&headers, params);
        assert_eq!(creds, ClientCredentials::new("header-key", "query-token"));
    }

    #[test]
    fn absent_credentials_are_empty() {
        let creds = credentials_from(&HeaderMap::new(), HandshakeParams::default());
        assert!(creds.api_key.is_empty());
        assert!(creds.api_token.is_empty());
    }

    #[test]
    fn rejections_map_to_http_status() {
        assert_eq!(
            rejection_response(&AuthError::InvalidCredentials).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            rejection_response(&AuthError::MissingCredentials).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            rejection_response(&AuthError::Unavailable("down".to_string())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
