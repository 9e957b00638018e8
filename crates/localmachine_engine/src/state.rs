//! Sync service state machine.
//!
//! A cycle runs `Idle → Pushing → Pulling → ExchangingAcks → Replaying →
//! Idle` under the sync lock. Push and ack-exchange failures abort the cycle
//! and are returned as errors; a pull failure is recorded and reported in the
//! cycle report while the cycle carries on. All state is re-read from the
//! database at the start of every phase.

use crate::config::AgentConfig;
use crate::database::LocalDatabase;
use crate::error::{SyncError, SyncResult};
use crate::error_recorder::ErrorRecorder;
use crate::event_store::EventStore;
use crate::importer::{EventImporter, ImportSummary, ReplayContext, ReplayDispatch};
use crate::lock::LockProvider;
use crate::records::ErrorType;
use crate::transport::OnlineWebClient;
use chrono::Utc;
use localmachine_protocol::{
    AckExchangeRequest, ConfirmAcksRequest, Event, EventFile, EventId, EventResourcePacker,
    PeeringEventsRequest, ProtocolError, PushEventsRequest,
};
use localmachine_storage::NamedLocks;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The current state of the sync service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle running.
    Idle,
    /// Uploading local events.
    Pushing,
    /// Downloading events addressed to this facility.
    Pulling,
    /// Swapping acks with the web service.
    ExchangingAcks,
    /// Replaying stored events that are still pending.
    Replaying,
}

impl SyncState {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncState::Idle)
    }
}

/// Statistics about sync cycles. In memory only.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that ran to the end.
    pub cycles_completed: u64,
    /// Cycles skipped because another cycle held the lock.
    pub cycles_skipped: u64,
    /// Cycles aborted by an error.
    pub cycles_failed: u64,
    /// Events uploaded.
    pub events_pushed: u64,
    /// Events downloaded.
    pub events_pulled: u64,
    /// Events replayed.
    pub events_replayed: u64,
    /// Acks delivered to the web service.
    pub acks_sent: u64,
    /// Acks received for events this agent sent.
    pub acks_received: u64,
    /// When the last cycle ended.
    pub last_cycle_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Outcome of a phase that does not abort the cycle when it fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The phase ran; `events` were processed.
    Completed {
        /// Events processed.
        events: usize,
    },
    /// The phase failed and the failure was recorded.
    Failed {
        /// Error message.
        error: String,
    },
}

impl PhaseOutcome {
    /// Returns true if the phase completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, PhaseOutcome::Completed { .. })
    }
}

/// What a completed cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Events uploaded and confirmed.
    pub pushed: usize,
    /// Pull phase result.
    pub pull: PhaseOutcome,
    /// Acks delivered.
    pub acks_sent: usize,
    /// Local events confirmed by received acks.
    pub acks_received: usize,
    /// Replay results of the pull and replay phases.
    pub replay: ImportSummary,
    /// Wall time of the cycle.
    pub duration: Duration,
}

impl CycleReport {
    /// Returns true if the cycle moved events or acks or replayed anything.
    pub fn moved_anything(&self) -> bool {
        let pulled = matches!(self.pull, PhaseOutcome::Completed { events } if events > 0);
        self.pushed > 0
            || pulled
            || self.acks_sent > 0
            || self.acks_received > 0
            || self.replay != ImportSummary::default()
    }
}

/// Result of a request to run a cycle.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// Another cycle held the lock; nothing was done.
    Skipped,
    /// The cycle ran.
    Completed(CycleReport),
}

/// Orchestrates push, pull, ack exchange and replay for one agent.
pub struct SyncService<C: OnlineWebClient> {
    config: AgentConfig,
    client: C,
    store: EventStore,
    errors: ErrorRecorder,
    importer: EventImporter,
    locks: Arc<dyn LockProvider>,
    context: ReplayContext,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl<C: OnlineWebClient> SyncService<C> {
    /// Creates a service over `db`.
    pub fn new(
        config: AgentConfig,
        db: Arc<LocalDatabase>,
        client: C,
        dispatch: ReplayDispatch,
    ) -> Self {
        let store = EventStore::new(Arc::clone(&db), config.home_facility);
        let errors = ErrorRecorder::new(db);
        let importer = EventImporter::new(store.clone(), errors.clone(), dispatch);
        let context = ReplayContext::new(config.home_facility);

        Self {
            config,
            client,
            store,
            errors,
            importer,
            locks: Arc::new(NamedLocks::new()),
            context,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Uses `locks` for the sync lock.
    pub fn with_lock_provider(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = locks;
        self
    }

    /// Uses `context` for replays.
    pub fn with_replay_context(mut self, context: ReplayContext) -> Self {
        self.context = context;
        self
    }

    /// The configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The event store.
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// The error recorder.
    pub fn errors(&self) -> &ErrorRecorder {
        &self.errors
    }

    /// The importer.
    pub fn importer(&self) -> &EventImporter {
        &self.importer
    }

    /// The replay context.
    pub fn replay_context(&self) -> &ReplayContext {
        &self.context
    }

    /// The transport client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Runs one cycle unless another one holds the sync lock.
    ///
    /// # Errors
    ///
    /// Push and ack-exchange failures abort the cycle. They have already been
    /// recorded as error records when this returns.
    pub fn sync_cycle(&self) -> SyncResult<CycleOutcome> {
        let Some(_guard) = self
            .locks
            .try_lock(&self.config.sync_lock_name, self.config.sync_lock_wait)
        else {
            debug!(lock = %self.config.sync_lock_name, "sync lock busy, skipping cycle");
            self.stats.write().cycles_skipped += 1;
            return Ok(CycleOutcome::Skipped);
        };

        let start = Instant::now();
        let result = self.run_cycle(start);
        self.set_state(SyncState::Idle);

        let mut stats = self.stats.write();
        stats.last_cycle_time = Some(Instant::now());
        match &result {
            Ok(report) => {
                stats.cycles_completed += 1;
                stats.events_pushed += report.pushed as u64;
                if let PhaseOutcome::Completed { events } = report.pull {
                    stats.events_pulled += events as u64;
                }
                stats.events_replayed += report.replay.replayed as u64;
                stats.acks_sent += report.acks_sent as u64;
                stats.acks_received += report.acks_received as u64;
                stats.last_error = match &report.pull {
                    PhaseOutcome::Failed { error } => Some(error.clone()),
                    PhaseOutcome::Completed { .. } => None,
                };
                info!(
                    pushed = report.pushed,
                    pull = ?report.pull,
                    acks_sent = report.acks_sent,
                    acks_received = report.acks_received,
                    replayed = report.replay.replayed,
                    elapsed_ms = report.duration.as_millis() as u64,
                    "sync cycle completed"
                );
            }
            Err(e) => {
                stats.cycles_failed += 1;
                stats.last_error = Some(e.to_string());
                warn!(error = %e, "sync cycle aborted");
            }
        }

        result.map(CycleOutcome::Completed)
    }

    fn run_cycle(&self, start: Instant) -> SyncResult<CycleReport> {
        self.set_state(SyncState::Pushing);
        let pushed = self.push()?;

        self.set_state(SyncState::Pulling);
        let (pull, mut replay) = self.pull();

        self.set_state(SyncState::ExchangingAcks);
        let (acks_sent, acks_received) = self.exchange_acks()?;

        self.set_state(SyncState::Replaying);
        let pending = self.store.get_events_pending_replay();
        if !pending.is_empty() {
            replay.merge(self.importer.import_events(&pending, &self.context)?);
        }

        let report = CycleReport {
            pushed,
            pull,
            acks_sent,
            acks_received,
            replay,
            duration: start.elapsed(),
        };

        if report.pull.is_completed() && (report.moved_anything() || self.last_synced_is_stale()) {
            self.store.transaction(|txn| {
                self.store.set_last_synced(txn, Utc::now());
                Ok(())
            })?;
        }
        Ok(report)
    }

    /// Idle cycles leave the journal untouched until the recorded sync time
    /// is older than `idle_sync_refresh`.
    fn last_synced_is_stale(&self) -> bool {
        match self.store.last_synced_time() {
            None => true,
            Some(time) => (Utc::now() - time)
                .to_std()
                .map_or(false, |age| age >= self.config.idle_sync_refresh),
        }
    }

    /// Uploads every unsynced event, block by block.
    ///
    /// A block's events are confirmed right after its upload succeeded. On
    /// failure the block in flight is recorded as `SYNC_UP` and left
    /// unconfirmed for the next cycle.
    fn push(&self) -> SyncResult<usize> {
        let events = self.store.get_events_for_online_web();
        if events.is_empty() {
            return Ok(0);
        }

        let mut in_flight = Vec::new();
        match self.push_blocks(&events, &mut in_flight) {
            Ok(pushed) => Ok(pushed),
            Err(e) => {
                self.errors.record_quietly(ErrorType::SyncUp, &e, &in_flight);
                Err(e)
            }
        }
    }

    fn push_blocks(&self, events: &[Event], in_flight: &mut Vec<EventId>) -> SyncResult<usize> {
        let mut packer = EventResourcePacker::new(self.config.network_capacity);
        let mut pushed = 0;

        for event in events {
            let remaining = match packer.write_event_and_get_remaining_capacity(event) {
                Ok(remaining) => remaining,
                Err(ProtocolError::CapacityExceeded { .. }) => {
                    pushed += self.upload(packer.finish(), in_flight)?;
                    packer.write_event_and_get_remaining_capacity(event)?
                }
                Err(e) => return Err(e.into()),
            };
            in_flight.push(event.id);

            if remaining <= 0 {
                pushed += self.upload(packer.finish(), in_flight)?;
            }
        }

        if !packer.is_empty() {
            pushed += self.upload(packer.finish(), in_flight)?;
        }
        Ok(pushed)
    }

    fn upload(&self, file: EventFile, in_flight: &mut Vec<EventId>) -> SyncResult<usize> {
        let ids = file.event_ids().to_vec();
        let bytes = file.len();
        let request = PushEventsRequest {
            facility_id: self.config.home_facility,
            agent_version: self.config.agent_version,
            file: file.into_bytes(),
        };
        let response = self.client.push_events(&request)?;

        let accepted: HashSet<EventId> = response.accepted.into_iter().collect();
        if let Some(missing) = ids.iter().find(|id| !accepted.contains(id)) {
            return Err(SyncError::transport_retryable(format!(
                "web service did not accept event {missing}"
            )));
        }

        self.store.transaction(|txn| {
            self.store.confirm_events_by_web(txn, &ids);
            Ok(())
        })?;
        in_flight.clear();

        debug!(
            events = ids.len(),
            bytes,
            duplicates = response.duplicates,
            "uploaded event block"
        );
        Ok(ids.len())
    }

    /// Pulls all pages of peering events and replays them.
    ///
    /// Never aborts the cycle: failures are recorded as `SYNC_DOWN` and
    /// reported.
    fn pull(&self) -> (PhaseOutcome, ImportSummary) {
        let mut cursor = 0u64;
        let mut total = 0usize;
        let mut replay = ImportSummary::default();

        loop {
            let request = PeeringEventsRequest {
                facility_id: self.config.home_facility,
                agent_version: self.config.agent_version,
                cursor,
            };

            let page = match self.pull_page(&request) {
                Ok(page) => page,
                Err((e, event_ids)) => {
                    self.errors.record_quietly(ErrorType::SyncDown, &e, &event_ids);
                    return (
                        PhaseOutcome::Failed {
                            error: e.to_string(),
                        },
                        replay,
                    );
                }
            };

            total += page.events;
            replay.merge(page.replay);

            if !page.has_more || page.next_cursor <= cursor {
                break;
            }
            cursor = page.next_cursor;
        }

        (PhaseOutcome::Completed { events: total }, replay)
    }

    fn pull_page(&self, request: &PeeringEventsRequest) -> Result<PulledPage, (SyncError, Vec<EventId>)> {
        let response = self
            .client
            .peering_events(request)
            .map_err(|e| (e, Vec::new()))?;

        let mut page = PulledPage {
            events: 0,
            replay: ImportSummary::default(),
            next_cursor: response.next_cursor,
            has_more: response.has_more,
        };
        let Some(file) = response.file else {
            return Ok(page);
        };

        let events = EventFile::decode(&file).map_err(|e| {
            (
                SyncError::FileIntegrity {
                    file: "peering events".into(),
                    reason: e.to_string(),
                },
                Vec::new(),
            )
        })?;
        if events.is_empty() {
            return Ok(page);
        }
        let ids: Vec<EventId> = events.iter().map(|e| e.id).collect();

        self.store
            .transaction(|txn| Ok(self.store.save_pulled_events(txn, &events)))
            .map_err(|e| (e, ids.clone()))?;
        page.replay = self
            .importer
            .import_events(&events, &self.context)
            .map_err(|e| (e, ids))?;
        page.events = events.len();

        debug!(events = page.events, cursor = request.cursor, "pulled peering events");
        Ok(page)
    }

    /// Swaps acks with the web service.
    fn exchange_acks(&self) -> SyncResult<(usize, usize)> {
        let outgoing = self.store.get_not_shipped_acks();
        let outgoing_ids: Vec<EventId> = outgoing.iter().map(|a| a.event_id).collect();

        let request = AckExchangeRequest {
            facility_id: self.config.home_facility,
            agent_version: self.config.agent_version,
            acks: outgoing.clone(),
        };
        let response = self.client.exchange_acks(&request).map_err(|e| {
            self.errors
                .record_quietly(ErrorType::ExchangeUp, &e, &outgoing_ids);
            e
        })?;

        let incoming = response.acks;
        let incoming_ids: Vec<EventId> = incoming.iter().map(|a| a.event_id).collect();

        let confirmed = self
            .store
            .transaction(|txn| {
                self.store.confirm_ack_shipped(txn, &outgoing);
                Ok(self.store.confirm_events_by_acks(txn, &incoming))
            })
            .map_err(|e| {
                self.errors
                    .record_quietly(ErrorType::ExchangeDown, &e, &incoming_ids);
                e
            })?;

        if !incoming_ids.is_empty() {
            let request = ConfirmAcksRequest {
                facility_id: self.config.home_facility,
                agent_version: self.config.agent_version,
                event_ids: incoming_ids.clone(),
            };
            self.client.confirm_acks(&request).map_err(|e| {
                self.errors
                    .record_quietly(ErrorType::ExchangeDown, &e, &incoming_ids);
                e
            })?;
        }

        debug!(sent = outgoing.len(), received = incoming_ids.len(), confirmed, "exchanged acks");
        Ok((outgoing.len(), confirmed))
    }
}

struct PulledPage {
    events: usize,
    replay: ImportSummary,
    next_cursor: u64,
    has_more: bool,
}
