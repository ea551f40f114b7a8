//! The HTTP-visible failure taxonomy.
//!
//! Every failure the gateway can surface to a client maps to exactly one
//! [`GatewayError`] variant, and every variant maps to one HTTP status. The
//! RPC surface never raises: handlers return `Result<_, GatewayError>` and
//! the [`IntoResponse`] impl turns the error into a structured JSON body
//! `{"error": "..."}` with the appropriate status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// All client-visible failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed JSON body, missing required field.
    #[error("{0}")]
    BadRequest(String),
    /// Endpoint hit with the wrong verb.
    #[error("method not allowed")]
    MethodNotAllowed,
    /// Client IP outside the allow-list, or a path escape attempt.
    #[error("forbidden")]
    Forbidden,
    /// Unknown URL path or missing filesystem entry.
    #[error("not found")]
    NotFound,
    /// Interaction respond against an unknown or already-resolved request.
    #[error("{0}")]
    Conflict(String),
    /// Interaction respond against a session that has since exited.
    #[error("{0}")]
    Gone(String),
    /// The child returned an error object; its message is propagated.
    #[error("{0}")]
    Rpc(String),
    /// The waiter deadline elapsed before a matching response arrived.
    #[error("RPC request timed out: {0}")]
    RpcTimeout(String),
    /// The child exited while a call was in flight.
    #[error("app-server exited")]
    TransportClosed,
    /// Server-side failure outside the taxonomy above (e.g. spawn failure).
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// The HTTP status this failure is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Rpc(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Gone(_) => StatusCode::GONE,
            Self::RpcTimeout(_) | Self::TransportClosed | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(
            GatewayError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::MethodNotAllowed.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(GatewayError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(GatewayError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::Conflict("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(GatewayError::Gone("x".into()).status(), StatusCode::GONE);
        assert_eq!(GatewayError::Rpc("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GatewayError::RpcTimeout("m".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::TransportClosed.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn timeout_message_names_the_method() {
        let e = GatewayError::RpcTimeout("turn/start".into());
        assert_eq!(e.to_string(), "RPC request timed out: turn/start");
    }

    #[test]
    fn transport_closed_message_is_stable() {
        // Clients match on this string; see the crash-recovery scenario.
        assert_eq!(GatewayError::TransportClosed.to_string(), "app-server exited");
    }
}
