//! Journaled agent database.
//!
//! All agent state (events, acks, error records and the last-sync row) lives
//! in [`Tables`]. Every committed transaction is appended to the journal as a
//! single CBOR frame holding its mutations; opening the database replays the
//! frames in order.
//!
//! Transactions read the latest committed state overlaid with their own
//! writes. The overlay only holds copies of the rows the transaction touched.
//! No lock is held while the transaction body runs, so an independent
//! transaction (such as recording an error) can commit while another one is
//! still open. Mutations are applied against the latest committed state at
//! commit time and are idempotent.

use crate::error::SyncResult;
use crate::records::{ErrorRecord, LastSyncReplayRecord};
use chrono::{DateTime, Utc};
use localmachine_protocol::{from_cbor, to_cbor, Ack, Event, EventId};
use localmachine_storage::{FileBackend, InMemoryBackend, Journal, StorageBackend};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// One journaled change.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Mutation {
    AppendEvent(Event),
    MarkOnlineWebSynced(Vec<EventId>),
    MarkReceiverSynced(Vec<EventId>),
    MarkReplayed(EventId),
    PutAcks(Vec<Ack>),
    MarkAcksShipped(Vec<EventId>),
    AppendError(ErrorRecord),
    SetLastSynced(DateTime<Utc>),
    SetLastReplayed(DateTime<Utc>),
}

/// In-memory view of the agent database.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    events: Vec<Event>,
    event_index: HashMap<EventId, usize>,
    acks: Vec<Ack>,
    ack_index: HashMap<EventId, usize>,
    errors: Vec<ErrorRecord>,
    last_sync_replay: LastSyncReplayRecord,
}

impl Tables {
    /// All events in creation order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Looks up an event.
    pub fn event(&self, id: &EventId) -> Option<&Event> {
        self.event_index.get(id).map(|&i| &self.events[i])
    }

    /// Returns true if the event is stored.
    pub fn contains_event(&self, id: &EventId) -> bool {
        self.event_index.contains_key(id)
    }

    /// All acks in creation order.
    pub fn acks(&self) -> &[Ack] {
        &self.acks
    }

    /// Looks up the ack for an event.
    pub fn ack(&self, event_id: &EventId) -> Option<&Ack> {
        self.ack_index.get(event_id).map(|&i| &self.acks[i])
    }

    /// All error records in creation order.
    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    /// Error records newer than the last successful sync.
    pub fn errors_since_last_sync(&self) -> impl Iterator<Item = &ErrorRecord> {
        let since = self.last_sync_replay.last_synced_time;
        self.errors
            .iter()
            .filter(move |e| since.map_or(true, |t| e.occurred_time > t))
    }

    /// The singleton last-sync row.
    pub fn last_sync_replay(&self) -> &LastSyncReplayRecord {
        &self.last_sync_replay
    }

    fn event_mut(&mut self, id: &EventId) -> Option<&mut Event> {
        match self.event_index.get(id) {
            Some(&i) => self.events.get_mut(i),
            None => None,
        }
    }

    fn apply(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::AppendEvent(event) => {
                if !self.event_index.contains_key(&event.id) {
                    self.event_index.insert(event.id, self.events.len());
                    self.events.push(event.clone());
                }
            }
            Mutation::MarkOnlineWebSynced(ids) => {
                for id in ids {
                    if let Some(event) = self.event_mut(id) {
                        event.online_web_synced = true;
                    }
                }
            }
            Mutation::MarkReceiverSynced(ids) => {
                for id in ids {
                    if let Some(event) = self.event_mut(id) {
                        event.receiver_synced = true;
                        event.online_web_synced = true;
                    }
                }
            }
            Mutation::MarkReplayed(id) => {
                if let Some(event) = self.event_mut(id) {
                    event.local_replayed = true;
                }
            }
            Mutation::PutAcks(acks) => {
                for ack in acks {
                    if !self.ack_index.contains_key(&ack.event_id) {
                        self.ack_index.insert(ack.event_id, self.acks.len());
                        self.acks.push(*ack);
                    }
                }
            }
            Mutation::MarkAcksShipped(ids) => {
                for id in ids {
                    if let Some(&i) = self.ack_index.get(id) {
                        self.acks[i].shipped = true;
                    }
                }
            }
            Mutation::AppendError(record) => self.errors.push(record.clone()),
            Mutation::SetLastSynced(time) => {
                self.last_sync_replay.last_synced_time = Some(*time);
            }
            Mutation::SetLastReplayed(time) => {
                self.last_sync_replay.last_replayed_time = Some(*time);
            }
        }
    }
}

struct Inner {
    journal: Journal,
    tables: Tables,
}

/// The agent's durable local database.
pub struct LocalDatabase {
    inner: RwLock<Inner>,
    replay_gate: Mutex<()>,
}

impl LocalDatabase {
    /// Opens (or creates) a database journal at `path`.
    ///
    /// The file is locked exclusively for the lifetime of the database.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path.as_ref())?;
        Self::open_with_backend(Box::new(backend))
    }

    /// Opens a database that lives only in memory.
    pub fn open_in_memory() -> SyncResult<Self> {
        Self::open_with_backend(Box::new(InMemoryBackend::new()))
    }

    /// Opens a database over any storage backend.
    pub fn open_with_backend(backend: Box<dyn StorageBackend>) -> SyncResult<Self> {
        let journal = Journal::open(backend)?;
        let mut tables = Tables::default();

        for frame in journal.read_frames()? {
            let mutations: Vec<Mutation> = from_cbor(&frame)?;
            for mutation in &mutations {
                tables.apply(mutation);
            }
        }

        debug!(
            frames = journal.frame_count(),
            events = tables.events.len(),
            acks = tables.acks.len(),
            "opened agent database"
        );

        Ok(Self {
            inner: RwLock::new(Inner { journal, tables }),
            replay_gate: Mutex::new(()),
        })
    }

    /// Runs `f` against the committed state.
    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.inner.read().tables)
    }

    /// Executes a function within a transaction.
    ///
    /// The transaction is committed if the function returns `Ok`, and
    /// discarded if it returns `Err`.
    pub fn transaction<F, T>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> SyncResult<T>,
    {
        let mut txn = Transaction {
            db: self,
            overlay: Overlay::default(),
            pending: Vec::new(),
        };
        let value = f(&mut txn)?;
        self.commit(txn.pending)?;
        Ok(value)
    }

    /// Serializes event replay across every importer of this database.
    pub(crate) fn replay_guard(&self) -> MutexGuard<'_, ()> {
        self.replay_gate.lock()
    }

    /// Number of committed transactions in the journal.
    pub fn committed_transactions(&self) -> u64 {
        self.inner.read().journal.frame_count()
    }

    /// Journal size in bytes.
    pub fn journal_size(&self) -> SyncResult<u64> {
        Ok(self.inner.read().journal.size()?)
    }

    fn commit(&self, pending: Vec<Mutation>) -> SyncResult<()> {
        if pending.is_empty() {
            return Ok(());
        }

        let frame = to_cbor(&pending)?;
        let mut inner = self.inner.write();
        inner.journal.append_frame(&frame)?;

        for mutation in &pending {
            inner.tables.apply(mutation);
        }
        Ok(())
    }
}

/// Rows written by an open transaction.
#[derive(Debug, Default)]
struct Overlay {
    events: HashMap<EventId, Event>,
    acks: HashMap<EventId, Ack>,
    errors: Vec<ErrorRecord>,
    last_sync_replay: Option<LastSyncReplayRecord>,
}

/// An open transaction.
///
/// Writes are buffered and become visible to other readers only on commit.
pub struct Transaction<'db> {
    db: &'db LocalDatabase,
    overlay: Overlay,
    pending: Vec<Mutation>,
}

impl<'db> Transaction<'db> {
    /// Looks up an event as this transaction sees it.
    pub fn event(&self, id: &EventId) -> Option<Event> {
        match self.overlay.events.get(id) {
            Some(event) => Some(event.clone()),
            None => self.db.read(|t| t.event(id).cloned()),
        }
    }

    /// Returns true if the event is stored or written by this transaction.
    pub fn contains_event(&self, id: &EventId) -> bool {
        self.overlay.events.contains_key(id) || self.db.read(|t| t.contains_event(id))
    }

    /// Looks up the ack for an event as this transaction sees it.
    pub fn ack(&self, event_id: &EventId) -> Option<Ack> {
        match self.overlay.acks.get(event_id) {
            Some(ack) => Some(*ack),
            None => self.db.read(|t| t.ack(event_id).copied()),
        }
    }

    /// The last-sync row as this transaction sees it.
    pub fn last_sync_replay(&self) -> LastSyncReplayRecord {
        match &self.overlay.last_sync_replay {
            Some(record) => record.clone(),
            None => self.db.read(|t| t.last_sync_replay().clone()),
        }
    }

    /// Error records newer than the last successful sync, including the
    /// ones written by this transaction.
    pub fn errors_since_last_sync(&self) -> Vec<ErrorRecord> {
        let since = self.last_sync_replay().last_synced_time;
        let newer = move |e: &&ErrorRecord| since.map_or(true, |t| e.occurred_time > t);
        let mut errors: Vec<ErrorRecord> =
            self.db.read(|t| t.errors().iter().filter(newer).cloned().collect());
        errors.extend(self.overlay.errors.iter().filter(newer).cloned());
        errors
    }

    /// The database this transaction belongs to.
    pub fn database(&self) -> &'db LocalDatabase {
        self.db
    }

    /// Returns true if the transaction has buffered writes.
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn append_event(&mut self, event: Event) {
        self.write(Mutation::AppendEvent(event));
    }

    pub(crate) fn mark_online_web_synced(&mut self, ids: Vec<EventId>) {
        if !ids.is_empty() {
            self.write(Mutation::MarkOnlineWebSynced(ids));
        }
    }

    pub(crate) fn mark_receiver_synced(&mut self, ids: Vec<EventId>) {
        if !ids.is_empty() {
            self.write(Mutation::MarkReceiverSynced(ids));
        }
    }

    pub(crate) fn mark_replayed(&mut self, id: EventId) {
        self.write(Mutation::MarkReplayed(id));
    }

    pub(crate) fn put_acks(&mut self, acks: Vec<Ack>) {
        if !acks.is_empty() {
            self.write(Mutation::PutAcks(acks));
        }
    }

    pub(crate) fn mark_acks_shipped(&mut self, ids: Vec<EventId>) {
        if !ids.is_empty() {
            self.write(Mutation::MarkAcksShipped(ids));
        }
    }

    pub(crate) fn append_error(&mut self, record: ErrorRecord) {
        self.write(Mutation::AppendError(record));
    }

    pub(crate) fn set_last_synced(&mut self, time: DateTime<Utc>) {
        self.write(Mutation::SetLastSynced(time));
    }

    pub(crate) fn set_last_replayed(&mut self, time: DateTime<Utc>) {
        self.write(Mutation::SetLastReplayed(time));
    }

    fn write(&mut self, mutation: Mutation) {
        self.stage(&mutation);
        self.pending.push(mutation);
    }

    fn stage(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::AppendEvent(event) => {
                if !self.contains_event(&event.id) {
                    self.overlay.events.insert(event.id, event.clone());
                }
            }
            Mutation::MarkOnlineWebSynced(ids) => {
                for id in ids {
                    if let Some(event) = self.staged_event(id) {
                        event.online_web_synced = true;
                    }
                }
            }
            Mutation::MarkReceiverSynced(ids) => {
                for id in ids {
                    if let Some(event) = self.staged_event(id) {
                        event.receiver_synced = true;
                        event.online_web_synced = true;
                    }
                }
            }
            Mutation::MarkReplayed(id) => {
                if let Some(event) = self.staged_event(id) {
                    event.local_replayed = true;
                }
            }
            Mutation::PutAcks(acks) => {
                for ack in acks {
                    if self.ack(&ack.event_id).is_none() {
                        self.overlay.acks.insert(ack.event_id, *ack);
                    }
                }
            }
            Mutation::MarkAcksShipped(ids) => {
                for id in ids {
                    if let Some(mut ack) = self.ack(id) {
                        ack.shipped = true;
                        self.overlay.acks.insert(*id, ack);
                    }
                }
            }
            Mutation::AppendError(record) => self.overlay.errors.push(record.clone()),
            Mutation::SetLastSynced(time) => {
                self.staged_last_sync_replay().last_synced_time = Some(*time);
            }
            Mutation::SetLastReplayed(time) => {
                self.staged_last_sync_replay().last_replayed_time = Some(*time);
            }
        }
    }

    fn staged_event(&mut self, id: &EventId) -> Option<&mut Event> {
        if !self.overlay.events.contains_key(id) {
            let committed = self.db.read(|t| t.event(id).cloned())?;
            self.overlay.events.insert(*id, committed);
        }
        self.overlay.events.get_mut(id)
    }

    fn staged_last_sync_replay(&mut self) -> &mut LastSyncReplayRecord {
        if self.overlay.last_sync_replay.is_none() {
            self.overlay.last_sync_replay = Some(self.last_sync_replay());
        }
        self.overlay.last_sync_replay.get_or_insert_with(LastSyncReplayRecord::default)
    }
}
