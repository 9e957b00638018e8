//! Persistent record types owned by the agent database.

use chrono::{DateTime, Utc};
use localmachine_protocol::EventId;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of a recorded sync failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    /// Pushing local events failed.
    SyncUp,
    /// Pulling peering events failed.
    SyncDown,
    /// Sending local acks failed.
    ExchangeUp,
    /// Applying received acks failed.
    ExchangeDown,
    /// Replaying an event failed.
    Replay,
    /// An imported file failed its checksum.
    FileIntegrity,
    /// An imported file was addressed to another facility.
    FacilityMismatch,
}

impl ErrorType {
    /// Upper-case name as shown to operators.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::SyncUp => "SYNC_UP",
            ErrorType::SyncDown => "SYNC_DOWN",
            ErrorType::ExchangeUp => "EXCHANGE_UP",
            ErrorType::ExchangeDown => "EXCHANGE_DOWN",
            ErrorType::Replay => "REPLAY",
            ErrorType::FileIntegrity => "FILE_INTEGRITY",
            ErrorType::FacilityMismatch => "FACILITY_MISMATCH",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context of a recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Kind name of the root cause.
    pub error_name: String,
    /// Translation key, if any.
    pub message_key: Option<String>,
    /// Events affected by the failure.
    pub event_ids: Vec<EventId>,
    /// Innermost application frame that observed the failure.
    pub root_stack_frame: String,
    /// Human-readable message.
    pub detail_message: Option<String>,
}

/// A durable record of a sync failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Record id.
    pub id: Uuid,
    /// When the failure was recorded.
    pub occurred_time: DateTime<Utc>,
    /// Failure kind.
    pub error_type: ErrorType,
    /// Failure context.
    pub payload: ErrorPayload,
}

/// Id of the single [`LastSyncReplayRecord`] row.
pub const LAST_SYNC_REPLAY_RECORD_ID: u32 = 1;

/// Times of the last successful sync and replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSyncReplayRecord {
    /// Always [`LAST_SYNC_REPLAY_RECORD_ID`].
    pub id: u32,
    /// End of the last cycle in which push and pull both succeeded.
    pub last_synced_time: Option<DateTime<Utc>>,
    /// End of the last successful replay.
    pub last_replayed_time: Option<DateTime<Utc>>,
}

impl Default for LastSyncReplayRecord {
    fn default() -> Self {
        Self {
            id: LAST_SYNC_REPLAY_RECORD_ID,
            last_synced_time: None,
            last_replayed_time: None,
        }
    }
}
