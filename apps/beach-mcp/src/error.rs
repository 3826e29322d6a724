use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::jsonrpc::{codes, EnvelopeError, JsonRpcError, JsonRpcResponse};

/// What the client was trying to do with a session id that turned out unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIntent {
    Continue,
    Terminate,
}

/// Failures raised before a request reaches a session controller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("origin {origin} is not allowed")]
    AccessDenied { origin: String },
    #[error("unsupported protocol version {version}")]
    VersionMismatch { version: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("session not found")]
    SessionNotFound(SessionIntent),
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl TransportError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        TransportError::Malformed(reason.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            TransportError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            TransportError::VersionMismatch { .. }
            | TransportError::Parse(_)
            | TransportError::Malformed(_) => StatusCode::BAD_REQUEST,
            TransportError::SessionNotFound(SessionIntent::Continue) => StatusCode::BAD_REQUEST,
            TransportError::SessionNotFound(SessionIntent::Terminate) => StatusCode::NOT_FOUND,
            TransportError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn rpc_error(&self) -> JsonRpcError {
        match self {
            TransportError::AccessDenied { .. } => {
                JsonRpcError::new(codes::ACCESS_DENIED, "access denied: origin not allowed")
            }
            TransportError::VersionMismatch { version } => JsonRpcError::new(
                codes::VERSION_MISMATCH,
                format!("unsupported protocol version {version}"),
            ),
            TransportError::Parse(reason) => {
                JsonRpcError::new(codes::PARSE_ERROR, format!("parse error: {reason}"))
            }
            TransportError::Malformed(reason) => {
                JsonRpcError::new(codes::INVALID_REQUEST, format!("invalid request: {reason}"))
            }
            TransportError::SessionNotFound(_) => {
                JsonRpcError::new(codes::SESSION_NOT_FOUND, "session not found")
            }
            TransportError::Internal(_) => {
                JsonRpcError::new(codes::INTERNAL_ERROR, "internal error")
            }
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            TransportError::AccessDenied { .. } => "access_denied",
            TransportError::VersionMismatch { .. } => "version_mismatch",
            TransportError::Parse(_) => "parse_error",
            TransportError::Malformed(_) => "malformed",
            TransportError::SessionNotFound(_) => "session_not_found",
            TransportError::Internal(_) => "internal",
        }
    }
}

impl From<EnvelopeError> for TransportError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Parse(err) => TransportError::Parse(err.to_string()),
            EnvelopeError::Invalid(reason) => TransportError::Malformed(reason.to_string()),
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        if let TransportError::Internal(err) = &self {
            error!(error = ?err, "internal transport error");
        }
        let body = JsonRpcResponse::failure(Value::Null, self.rpc_error());
        (self.status(), Json(body)).into_response()
    }
}
