//! Durable recording of sync failures.
//!
//! Records are written in their own transaction, so they survive a rollback
//! of the operation that failed.

use crate::database::LocalDatabase;
use crate::error::{SyncError, SyncResult};
use crate::records::{ErrorPayload, ErrorRecord, ErrorType};
use chrono::Utc;
use localmachine_protocol::EventId;
use std::panic::Location;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Writes [`ErrorRecord`]s.
#[derive(Clone)]
pub struct ErrorRecorder {
    db: Arc<LocalDatabase>,
}

impl ErrorRecorder {
    /// Creates a recorder writing to `db`.
    pub fn new(db: Arc<LocalDatabase>) -> Self {
        Self { db }
    }

    /// Records `error` against `event_ids`.
    ///
    /// The caller's location is stored as the root frame. A retryable error
    /// whose type and name were already recorded since the last successful
    /// sync is not recorded again; `Ok(None)` is returned in that case.
    #[track_caller]
    pub fn record(
        &self,
        error_type: ErrorType,
        error: &SyncError,
        event_ids: &[EventId],
    ) -> SyncResult<Option<ErrorRecord>> {
        let location = Location::caller();
        let root_stack_frame = format!("{}:{}", location.file(), location.line());
        let error_name = error.kind_name();

        let recorded = self.db.transaction(|txn| {
            if error.is_retryable()
                && txn
                    .errors_since_last_sync()
                    .iter()
                    .any(|r| r.error_type == error_type && r.payload.error_name == error_name)
            {
                return Ok(None);
            }

            let record = ErrorRecord {
                id: Uuid::new_v4(),
                occurred_time: Utc::now(),
                error_type,
                payload: ErrorPayload {
                    error_name: error_name.to_string(),
                    message_key: error.message_key().map(str::to_string),
                    event_ids: event_ids.to_vec(),
                    root_stack_frame,
                    detail_message: Some(error.to_string()),
                },
            };
            txn.append_error(record.clone());
            Ok(Some(record))
        })?;

        match &recorded {
            Some(_) => warn!(
                error_type = %error_type,
                error_name,
                events = event_ids.len(),
                error = %error,
                "recorded sync failure"
            ),
            None => debug!(
                error_type = %error_type,
                error_name,
                "transient failure already recorded since last sync"
            ),
        }
        Ok(recorded)
    }

    /// Records `error`, logging instead of failing if the record cannot be
    /// written.
    #[track_caller]
    pub fn record_quietly(&self, error_type: ErrorType, error: &SyncError, event_ids: &[EventId]) {
        if let Err(e) = self.record(error_type, error, event_ids) {
            warn!(error_type = %error_type, error = %e, "failed to record sync failure");
        }
    }

    /// Records newer than the last successful sync.
    pub fn errors_since_last_sync(&self) -> Vec<ErrorRecord> {
        self.db
            .read(|t| t.errors_since_last_sync().cloned().collect())
    }

    /// All records, oldest first.
    pub fn all(&self) -> Vec<ErrorRecord> {
        self.db.read(|t| t.errors().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> ErrorRecorder {
        ErrorRecorder::new(Arc::new(LocalDatabase::open_in_memory().unwrap()))
    }

    #[test]
    fn captures_context() {
        let recorder = recorder();
        let id = EventId::new();
        let record = recorder
            .record(ErrorType::Replay, &SyncError::UnknownCategory("X".into()), &[id])
            .unwrap()
            .unwrap();

        assert_eq!(record.error_type, ErrorType::Replay);
        assert_eq!(record.payload.error_name, "UnknownCategoryError");
        assert_eq!(record.payload.event_ids, vec![id]);
        assert!(record.payload.root_stack_frame.contains("error_recorder.rs"));
        assert_eq!(
            record.payload.message_key.as_deref(),
            Some("localmachine.error.replay")
        );
    }

    #[test]
    fn repeated_transient_failures_recorded_once() {
        let recorder = recorder();
        let err = SyncError::transport_retryable("connection refused");

        assert!(recorder.record(ErrorType::SyncDown, &err, &[]).unwrap().is_some());
        assert!(recorder.record(ErrorType::SyncDown, &err, &[]).unwrap().is_none());
        assert!(recorder.record(ErrorType::SyncUp, &err, &[]).unwrap().is_some());
        assert_eq!(recorder.all().len(), 2);
    }

    #[test]
    fn business_failures_always_recorded() {
        let recorder = recorder();
        let err = SyncError::UnknownCategory("X".into());
        recorder.record(ErrorType::Replay, &err, &[]).unwrap();
        recorder.record(ErrorType::Replay, &err, &[]).unwrap();
        assert_eq!(recorder.errors_since_last_sync().len(), 2);
    }

    #[test]
    fn record_survives_failed_outer_transaction() {
        let db = Arc::new(LocalDatabase::open_in_memory().unwrap());
        let recorder = ErrorRecorder::new(Arc::clone(&db));

        let result: SyncResult<()> = db.transaction(|_txn| {
            let err = SyncError::Timeout;
            recorder.record_quietly(ErrorType::SyncUp, &err, &[]);
            Err(err)
        });

        assert!(result.is_err());
        assert_eq!(recorder.all().len(), 1);
    }
}
