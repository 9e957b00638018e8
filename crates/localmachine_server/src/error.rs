//! Error types for the central service.

use localmachine_protocol::{ErrorResponse, ProtocolError};
use std::time::Duration;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the central service.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format or content.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No route for the path.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// A requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The facility has no master-data offset yet.
    #[error("facility {0} has not resynced master data")]
    NoOffset(String),

    /// A named lock could not be acquired in time.
    #[error("unable to get lock {name} within {waited:?}")]
    UnableGetLock {
        /// Lock name.
        name: String,
        /// How long the request waited.
        waited: Duration,
    },

    /// Malformed wire data.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::UnknownEndpoint(_)
                | ServerError::NotFound(_)
                | ServerError::NoOffset(_)
                | ServerError::Protocol(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// HTTP status for this error.
    pub fn status(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Protocol(_) => 400,
            ServerError::UnknownEndpoint(_) | ServerError::NotFound(_) => 404,
            ServerError::NoOffset(_) => 409,
            ServerError::UnableGetLock { .. } => 503,
            ServerError::Internal(_) | ServerError::Io(_) => 500,
        }
    }

    /// Short kind name sent to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::InvalidRequest(_) => "InvalidRequest",
            ServerError::UnknownEndpoint(_) => "UnknownEndpoint",
            ServerError::NotFound(_) => "NotFound",
            ServerError::NoOffset(_) => "NoOffset",
            ServerError::UnableGetLock { .. } => "UnableGetLock",
            ServerError::Protocol(_) => "ProtocolError",
            ServerError::Internal(_) => "Internal",
            ServerError::Io(_) => "Io",
        }
    }

    /// Wire form of this error.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.status(), self.kind(), self.to_string())
    }
}
