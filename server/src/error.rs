//! Shared error types for the fabric.

use thiserror::Error;

pub type WsResult<T> = Result<T, WsError>;

/// Failure taxonomy for the fabric. Validation, authentication,
/// authorization, not-found and conflict errors are reported back to the
/// originating connection as an `error` reply; backend errors are
/// transient and retried where the caller has a retry policy.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("connection closed")]
    TransportClosed,

    #[error("update queue closed")]
    ChannelClosed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl WsError {
    /// Message shown to the client in an `error` reply.
    pub fn client_message(&self) -> String {
        self.to_string()
    }
}

impl From<sqlx::Error> for WsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => WsError::NotFound("row not found".to_string()),
            other => WsError::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for WsError {
    fn from(err: serde_json::Error) -> Self {
        WsError::Protocol(err.to_string())
    }
}
