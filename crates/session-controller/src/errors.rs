//! Session Controller error types.
//!
//! Errors map to wire `ErrorKind` values for participants and to HTTP status
//! codes for the admin API. Internal details are logged server-side but not
//! exposed to clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::jwt::TokenError;
use serde::Serialize;
use sync_protocol::ErrorKind;
use thiserror::Error;

/// Session Controller error type.
///
/// Maps to HTTP status codes:
/// - `Token`: 401 Unauthorized
/// - `PermissionDenied`: 403 Forbidden
/// - `SessionNotFound`, `ParticipantNotFound`: 404 Not Found
/// - `SessionClosing`, `NotActive`, `QueueFull`: 409 Conflict
/// - `Encoding`, `Protocol`: 400 Bad Request
/// - `SessionFull`, `CapacityExceeded`, `HostUnavailable`: 503 Service Unavailable
/// - `Config`, `Internal`: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum ScError {
    /// Token validation failed.
    #[error("Token error: {0}")]
    Token(TokenError),

    /// Session does not exist (never did, or already closed).
    #[error("Session not found")]
    SessionNotFound,

    /// Session is closing and no longer issues credentials.
    #[error("Session is closing")]
    SessionClosing,

    /// Join descriptor could not be produced or parsed.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Participant is not a member of the session.
    #[error("Participant not found")]
    ParticipantNotFound,

    /// Session reached its participant limit.
    #[error("Session is full")]
    SessionFull,

    /// Process reached its session limit.
    #[error("Server at capacity")]
    CapacityExceeded,

    /// Caller lacks the role for this operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Session is still forming.
    #[error("Session is not active")]
    NotActive,

    /// Play queue reached its limit.
    #[error("Queue is full")]
    QueueFull,

    /// No participant is eligible to act as host.
    #[error("Host unavailable")]
    HostUnavailable,

    /// Peer broke the wire protocol.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (channel failures, crypto failures).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScError {
    /// Returns the wire error kind for this error.
    #[must_use]
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ScError::Token(TokenError::Invalid) | ScError::Encoding(_) => ErrorKind::TokenInvalid,
            ScError::Token(TokenError::Expired) => ErrorKind::TokenExpired,
            ScError::Token(TokenError::Revoked) => ErrorKind::TokenRevoked,
            ScError::SessionNotFound | ScError::SessionClosing | ScError::ParticipantNotFound => {
                ErrorKind::SessionNotFound
            }
            ScError::SessionFull | ScError::CapacityExceeded => ErrorKind::SessionFull,
            ScError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ScError::NotActive => ErrorKind::NotActive,
            ScError::QueueFull => ErrorKind::QueueFull,
            ScError::HostUnavailable => ErrorKind::HostUnavailable,
            ScError::Protocol(_) => ErrorKind::ProtocolViolation,
            ScError::Config(_) | ScError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            ScError::Token(_) => StatusCode::UNAUTHORIZED,
            ScError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ScError::SessionNotFound | ScError::ParticipantNotFound => StatusCode::NOT_FOUND,
            ScError::SessionClosing | ScError::NotActive | ScError::QueueFull => {
                StatusCode::CONFLICT
            }
            ScError::Encoding(_) | ScError::Protocol(_) => StatusCode::BAD_REQUEST,
            ScError::SessionFull | ScError::CapacityExceeded | ScError::HostUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ScError::Config(_) | ScError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            ScError::Token(TokenError::Invalid) => "The token is invalid".to_string(),
            ScError::Token(TokenError::Expired) => "The token has expired".to_string(),
            ScError::Token(TokenError::Revoked) => "The token has been revoked".to_string(),
            ScError::SessionNotFound => "Session not found".to_string(),
            ScError::SessionClosing => "Session is closing".to_string(),
            ScError::Encoding(_) => "Join descriptor could not be processed".to_string(),
            ScError::ParticipantNotFound => "Participant not found".to_string(),
            ScError::SessionFull => "Session is full".to_string(),
            ScError::CapacityExceeded => "Server is at capacity, please try again".to_string(),
            ScError::NotActive => "Session has not started yet".to_string(),
            ScError::HostUnavailable => "No host is available".to_string(),
            ScError::QueueFull => "The queue is full".to_string(),
            ScError::PermissionDenied(msg) | ScError::Protocol(msg) => msg.clone(),
            ScError::Config(_) | ScError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

impl From<TokenError> for ScError {
    fn from(err: TokenError) -> Self {
        ScError::Token(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ScError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            ScError::Config(err) | ScError::Internal(err) => {
                tracing::error!(target: "sc.routes", error = %err, "Request failed");
            }
            ScError::Encoding(err) => {
                tracing::debug!(target: "sc.routes", error = %err, "Descriptor rejected");
            }
            _ => {}
        }

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.error_kind().as_str().to_uppercase(),
                message: self.client_message(),
            },
        };

        let mut response = (status, Json(error_response)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            if let Ok(header_value) =
                "Bearer realm=\"flowsync\", error=\"invalid_token\"".parse()
            {
                response
                    .headers_mut()
                    .insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}
