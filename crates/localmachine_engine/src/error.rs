//! Error types for the sync engine.

use localmachine_protocol::{EventId, FacilityId, ProtocolError};
use localmachine_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the next cycle may succeed.
        retryable: bool,
    },

    /// The web service answered with an error status.
    #[error("server error {status} ({kind}): {message}")]
    Server {
        /// HTTP-style status code.
        status: u16,
        /// Error kind reported by the service.
        kind: String,
        /// Message reported by the service.
        message: String,
    },

    /// A transport call exceeded the request timeout.
    #[error("operation timed out")]
    Timeout,

    /// Local storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encoding or packing failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A packed file failed checksum or structure validation.
    #[error("file {file} failed integrity check: {reason}")]
    FileIntegrity {
        /// Offending file name.
        file: String,
        /// What failed.
        reason: String,
    },

    /// An imported file is addressed to a different facility.
    #[error("file {file} is addressed to facility {actual}, this agent is {expected}")]
    FacilityMismatch {
        /// Offending file name.
        file: String,
        /// Home facility of this agent.
        expected: FacilityId,
        /// Receiver named in the file.
        actual: FacilityId,
    },

    /// A named lock could not be acquired in time.
    #[error("unable to get lock {name} within {waited:?}")]
    UnableGetLock {
        /// Lock name.
        name: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// No replay handler is registered for a category.
    #[error("no replay handler for category {0}")]
    UnknownCategory(String),

    /// A replay handler rejected an event.
    #[error("replay of event {event_id} failed: {message}")]
    Replay {
        /// Event being replayed.
        event_id: EventId,
        /// Handler message.
        message: String,
    },

    /// Archive read or write failure.
    #[error("archive error: {0}")]
    Archive(String),

    /// Master-data application failure.
    #[error("master data error: {0}")]
    MasterData(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error is transient and the next cycle may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Stable name of the error kind, stored as the error name of records.
    pub fn kind_name(&self) -> &'static str {
        match self {
            SyncError::Transport { .. } => "TransportError",
            SyncError::Server { .. } => "ServerError",
            SyncError::Timeout => "TimeoutError",
            SyncError::Storage(_) => "StorageError",
            SyncError::Protocol(_) => "ProtocolError",
            SyncError::FileIntegrity { .. } => "FileIntegrityError",
            SyncError::FacilityMismatch { .. } => "FacilityMismatchError",
            SyncError::UnableGetLock { .. } => "UnableGetLockError",
            SyncError::UnknownCategory(_) => "UnknownCategoryError",
            SyncError::Replay { .. } => "ReplayError",
            SyncError::Archive(_) => "ArchiveError",
            SyncError::MasterData(_) => "MasterDataError",
            SyncError::Io(_) => "IoError",
        }
    }

    /// Message key for operator-facing translation.
    pub fn message_key(&self) -> Option<&'static str> {
        match self {
            SyncError::Transport { .. } | SyncError::Timeout => Some("localmachine.error.network"),
            SyncError::Server { .. } => Some("localmachine.error.server"),
            SyncError::FileIntegrity { .. } => Some("localmachine.error.fileIntegrity"),
            SyncError::FacilityMismatch { .. } => Some("localmachine.error.facilityMismatch"),
            SyncError::UnableGetLock { .. } => Some("localmachine.error.unableGetLock"),
            SyncError::UnknownCategory(_) | SyncError::Replay { .. } => {
                Some("localmachine.error.replay")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("bad url").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Server {
            status: 502,
            kind: "BadGateway".into(),
            message: "upstream".into(),
        }
        .is_retryable());
        assert!(!SyncError::Server {
            status: 400,
            kind: "BadRequest".into(),
            message: "malformed".into(),
        }
        .is_retryable());
        assert!(!SyncError::UnknownCategory("X".into()).is_retryable());
    }

    #[test]
    fn facility_mismatch_display() {
        let expected = FacilityId::new();
        let actual = FacilityId::new();
        let err = SyncError::FacilityMismatch {
            file: "a.dat".into(),
            expected,
            actual,
        };
        let text = err.to_string();
        assert!(text.contains(&expected.to_string()));
        assert!(text.contains(&actual.to_string()));
        assert_eq!(err.kind_name(), "FacilityMismatchError");
    }

    #[test]
    fn message_keys() {
        assert_eq!(
            SyncError::Timeout.message_key(),
            Some("localmachine.error.network")
        );
        assert_eq!(SyncError::Archive("x".into()).message_key(), None);
    }
}
