//! Idempotent replay of received events.
//!
//! Each event is replayed in its own transaction together with setting its
//! replayed flag, so an event is handed to its business handler at most once
//! per successful commit. Replays of one database are serialized, so an
//! archive import racing a sync cycle cannot run a handler twice. A failing
//! event is recorded and the batch goes on; the event stays pending and is
//! retried by the next replay phase.

use crate::error::{SyncError, SyncResult};
use crate::error_recorder::ErrorRecorder;
use crate::event_store::EventStore;
use crate::records::ErrorType;
use chrono::Utc;
use localmachine_protocol::{Event, FacilityId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Identity under which replayed events act.
///
/// Passed explicitly to every handler instead of living in ambient session
/// state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayContext {
    /// Facility whose state is being changed.
    pub home_facility: FacilityId,
    /// User recorded as the author of replayed changes.
    pub acting_user: String,
    /// Identity the handler should impersonate, if any.
    pub simulated_identity: Option<String>,
}

impl ReplayContext {
    /// Creates a context acting as the system user.
    pub fn new(home_facility: FacilityId) -> Self {
        Self {
            home_facility,
            acting_user: "system".to_string(),
            simulated_identity: None,
        }
    }

    /// Sets the acting user.
    pub fn with_acting_user(mut self, user: impl Into<String>) -> Self {
        self.acting_user = user.into();
        self
    }

    /// Sets the simulated identity.
    pub fn with_simulated_identity(mut self, identity: impl Into<String>) -> Self {
        self.simulated_identity = Some(identity.into());
        self
    }
}

/// Business handler for one event category.
pub trait EventReplayer: Send + Sync {
    /// Applies the event's effects to local business state.
    fn replay(&self, event: &Event, context: &ReplayContext) -> Result<(), String>;
}

impl<F> EventReplayer for F
where
    F: Fn(&Event, &ReplayContext) -> Result<(), String> + Send + Sync,
{
    fn replay(&self, event: &Event, context: &ReplayContext) -> Result<(), String> {
        self(event, context)
    }
}

/// Category → handler table.
#[derive(Clone, Default)]
pub struct ReplayDispatch {
    handlers: HashMap<String, Arc<dyn EventReplayer>>,
}

impl ReplayDispatch {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `category`, replacing any previous one.
    pub fn with_handler(
        mut self,
        category: impl Into<String>,
        handler: impl EventReplayer + 'static,
    ) -> Self {
        self.handlers.insert(category.into(), Arc::new(handler));
        self
    }

    /// Registers a shared handler for `category`.
    pub fn register(&mut self, category: impl Into<String>, handler: Arc<dyn EventReplayer>) {
        self.handlers.insert(category.into(), handler);
    }

    /// Looks up the handler for `category`.
    pub fn handler(&self, category: &str) -> Option<&Arc<dyn EventReplayer>> {
        self.handlers.get(category)
    }

    /// Registered categories, sorted.
    pub fn categories(&self) -> Vec<&str> {
        let mut categories: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        categories.sort_unstable();
        categories
    }
}

/// Outcome of an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Events replayed now.
    pub replayed: usize,
    /// Events skipped: already replayed or not addressed to this facility.
    pub skipped: usize,
    /// Events whose replay failed.
    pub failed: usize,
}

impl ImportSummary {
    /// Adds another summary.
    pub fn merge(&mut self, other: ImportSummary) {
        self.replayed += other.replayed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Replays imported events exactly once per event id.
#[derive(Clone)]
pub struct EventImporter {
    store: EventStore,
    errors: ErrorRecorder,
    dispatch: ReplayDispatch,
}

impl EventImporter {
    /// Creates an importer.
    pub fn new(store: EventStore, errors: ErrorRecorder, dispatch: ReplayDispatch) -> Self {
        Self {
            store,
            errors,
            dispatch,
        }
    }

    /// The dispatch table.
    pub fn dispatch(&self) -> &ReplayDispatch {
        &self.dispatch
    }

    /// Replays `events` in order.
    ///
    /// Events unknown to the store are stored first. Only storage failures
    /// abort the batch; handler failures are recorded as `REPLAY` errors.
    pub fn import_events(
        &self,
        events: &[Event],
        context: &ReplayContext,
    ) -> SyncResult<ImportSummary> {
        let mut summary = ImportSummary::default();
        self.store_unknown(events, context.home_facility)?;

        for event in events {
            if event.receiver_id != context.home_facility {
                summary.skipped += 1;
                continue;
            }

            match self.replay_one(event, context) {
                Ok(true) => summary.replayed += 1,
                Ok(false) => summary.skipped += 1,
                Err(SyncError::Storage(e)) => return Err(SyncError::Storage(e)),
                Err(e) => {
                    self.errors.record_quietly(ErrorType::Replay, &e, &[event.id]);
                    summary.failed += 1;
                }
            }
        }

        if summary.replayed > 0 {
            self.store.transaction(|txn| {
                self.store.set_last_replayed(txn, Utc::now());
                Ok(())
            })?;
        }

        if summary != ImportSummary::default() {
            info!(
                replayed = summary.replayed,
                skipped = summary.skipped,
                failed = summary.failed,
                "imported events"
            );
        }
        Ok(summary)
    }

    /// Stores the events for `home` that are not stored yet, in one
    /// transaction.
    fn store_unknown(&self, events: &[Event], home: FacilityId) -> SyncResult<()> {
        let unknown: Vec<Event> = self.store.database().read(|t| {
            events
                .iter()
                .filter(|e| e.receiver_id == home && !t.contains_event(&e.id))
                .cloned()
                .collect()
        });
        if unknown.is_empty() {
            return Ok(());
        }
        self.store.transaction(|txn| {
            self.store.save_received_events(txn, &unknown);
            Ok(())
        })
    }

    /// Returns `Ok(true)` if the handler ran, `Ok(false)` if the event was
    /// already replayed.
    fn replay_one(&self, event: &Event, context: &ReplayContext) -> SyncResult<bool> {
        let _gate = self.store.database().replay_guard();
        let handler = self.dispatch.handler(&event.category);
        self.store.transaction(|txn| {
            if txn.event(&event.id).is_some_and(|e| e.local_replayed) {
                debug!(event_id = %event.id, "already replayed");
                return Ok(false);
            }

            let handler = handler.ok_or_else(|| SyncError::UnknownCategory(event.category.clone()))?;
            handler
                .replay(event, context)
                .map_err(|message| SyncError::Replay {
                    event_id: event.id,
                    message,
                })?;

            self.store.mark_replayed(txn, event.id);
            Ok(true)
        })
    }
}
