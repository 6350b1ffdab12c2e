//! Server error types.

use thiserror::Error;
use txnsvc_protocol::ErrorCode;
use txnsvc_store::StoreError;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] txnsvc_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(u16),

    #[error("invalid transaction ID: {0}")]
    InvalidTransactionId(#[source] uuid::Error),

    #[error("{0}")]
    NotFound(&'static str),

    #[error("{context}: {source}")]
    Persistence {
        context: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("deadline of {0} ms exceeded")]
    DeadlineExceeded(u64),
}

impl ServerError {
    /// Wraps a store failure with the operation it interrupted.
    pub fn persistence(context: &'static str, source: StoreError) -> Self {
        ServerError::Persistence { context, source }
    }

    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::InternalError,
            ServerError::Protocol(_) => ErrorCode::BadRequest,
            ServerError::Json(_) => ErrorCode::BadRequest,
            ServerError::InvalidRequest(_) => ErrorCode::BadRequest,
            ServerError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            ServerError::InvalidTransactionId(_) => ErrorCode::InvalidArgument,
            ServerError::NotFound(_) => ErrorCode::NotFound,
            ServerError::Persistence { .. } => ErrorCode::InternalError,
            ServerError::Internal(_) => ErrorCode::InternalError,
            ServerError::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
        }
    }
}
