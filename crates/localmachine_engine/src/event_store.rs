//! The agent's event log and ack bookkeeping.
//!
//! Reads work on the committed state and have no side effects. Every
//! mutation takes the caller's [`Transaction`], so a batch is either fully
//! applied or not at all.

use crate::database::{LocalDatabase, Transaction};
use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use localmachine_protocol::{Ack, Event, EventId, EventPayload, FacilityId};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Counters describing what an agent still has to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Facility the agent runs for.
    pub home_facility: FacilityId,
    /// Events stored locally.
    pub total_events: usize,
    /// Events not yet held by the web service.
    pub pending_push: usize,
    /// Events for this facility not yet replayed.
    pub pending_replay: usize,
    /// Events for other facilities whose receiver has not acknowledged them.
    pub pending_export: usize,
    /// Receipts not yet delivered to senders.
    pub unshipped_acks: usize,
    /// Last cycle in which push and pull succeeded.
    pub last_synced_time: Option<DateTime<Utc>>,
    /// Last successful replay.
    pub last_replayed_time: Option<DateTime<Utc>>,
    /// Failures recorded since the last successful sync.
    pub errors_since_last_sync: usize,
}

/// Event log of one agent.
#[derive(Clone)]
pub struct EventStore {
    db: Arc<LocalDatabase>,
    home_facility: FacilityId,
}

impl EventStore {
    /// Creates a store over `db` for `home_facility`.
    pub fn new(db: Arc<LocalDatabase>, home_facility: FacilityId) -> Self {
        Self { db, home_facility }
    }

    /// The underlying database.
    pub fn database(&self) -> &Arc<LocalDatabase> {
        &self.db
    }

    /// Facility this store belongs to.
    pub fn home_facility(&self) -> FacilityId {
        self.home_facility
    }

    /// Runs `f` in a transaction on the underlying database.
    pub fn transaction<F, T>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> SyncResult<T>,
    {
        self.db.transaction(f)
    }

    /// Looks up a stored event.
    pub fn get(&self, id: &EventId) -> Option<Event> {
        self.db.read(|t| t.event(id).cloned())
    }

    /// Events not yet held by the web service, in creation order.
    pub fn get_events_for_online_web(&self) -> Vec<Event> {
        self.db.read(|t| {
            t.events()
                .iter()
                .filter(|e| !e.online_web_synced)
                .cloned()
                .collect()
        })
    }

    /// Marks events as held by the web service.
    ///
    /// Call only after the transport confirmed receipt of every id given.
    pub fn confirm_events_by_web(&self, txn: &mut Transaction<'_>, ids: &[EventId]) {
        let ids = pending(txn, ids, |e| !e.online_web_synced);
        txn.mark_online_web_synced(ids);
    }

    /// Receipts not yet delivered to their senders.
    pub fn get_not_shipped_acks(&self) -> Vec<Ack> {
        self.db
            .read(|t| t.acks().iter().filter(|a| !a.shipped).copied().collect())
    }

    /// Marks receipts as delivered.
    pub fn confirm_ack_shipped(&self, txn: &mut Transaction<'_>, acks: &[Ack]) {
        let ids = acks
            .iter()
            .filter(|a| txn.ack(&a.event_id).is_some_and(|a| !a.shipped))
            .map(|a| a.event_id)
            .collect();
        txn.mark_acks_shipped(ids);
    }

    /// Applies receipts for events this agent sent: they are fully done.
    ///
    /// Returns how many events changed. Acks for unknown events are ignored.
    pub fn confirm_events_by_acks(&self, txn: &mut Transaction<'_>, acks: &[Ack]) -> usize {
        let ids: Vec<EventId> = acks.iter().map(|a| a.event_id).collect();
        let ids = pending(txn, &ids, |e| !e.receiver_synced);
        let count = ids.len();
        txn.mark_receiver_synced(ids);
        count
    }

    /// Events for other facilities that their receiver has not acknowledged,
    /// grouped by receiver, each group in creation order.
    pub fn get_events_for_export(&self, home_facility: FacilityId) -> BTreeMap<FacilityId, Vec<Event>> {
        self.db.read(|t| {
            let mut groups: BTreeMap<FacilityId, Vec<Event>> = BTreeMap::new();
            for event in t.events() {
                if event.receiver_id != home_facility && !event.receiver_synced {
                    groups.entry(event.receiver_id).or_default().push(event.clone());
                }
            }
            groups
        })
    }

    /// Records a business occurrence at this facility.
    ///
    /// Local business effects already happened, so the event is stored as
    /// replayed.
    pub fn emit(
        &self,
        txn: &mut Transaction<'_>,
        group_id: impl Into<String>,
        category: impl Into<String>,
        payload: EventPayload,
        receiver_id: FacilityId,
    ) -> Event {
        let mut event = Event::new(group_id, category, payload, self.home_facility, receiver_id);
        event.local_replayed = true;
        txn.append_event(event.clone());
        event
    }

    /// Stores events pulled from the web service and creates their receipts.
    ///
    /// Returns the ids that were new.
    pub fn save_pulled_events(&self, txn: &mut Transaction<'_>, events: &[Event]) -> Vec<EventId> {
        let new_ids = self.save_incoming(txn, events, true);
        let known: Vec<EventId> = events.iter().map(|e| e.id).collect();
        let known = pending(txn, &known, |e| !e.online_web_synced);
        txn.mark_online_web_synced(known);
        new_ids
    }

    /// Stores events received through an imported file and creates their
    /// receipts. They are still pushed to the web service on the next cycle.
    pub fn save_received_events(&self, txn: &mut Transaction<'_>, events: &[Event]) -> Vec<EventId> {
        self.save_incoming(txn, events, false)
    }

    /// Stored events for this facility that have not been replayed yet.
    pub fn get_events_pending_replay(&self) -> Vec<Event> {
        self.db.read(|t| {
            t.events()
                .iter()
                .filter(|e| e.receiver_id == self.home_facility && !e.local_replayed)
                .cloned()
                .collect()
        })
    }

    /// Marks an event as replayed.
    pub fn mark_replayed(&self, txn: &mut Transaction<'_>, id: EventId) {
        if txn.event(&id).is_some_and(|e| !e.local_replayed) {
            txn.mark_replayed(id);
        }
    }

    /// Records the end of a successful push/pull cycle.
    pub fn set_last_synced(&self, txn: &mut Transaction<'_>, time: DateTime<Utc>) {
        txn.set_last_synced(time);
    }

    /// Records the end of a successful replay.
    pub fn set_last_replayed(&self, txn: &mut Transaction<'_>, time: DateTime<Utc>) {
        txn.set_last_replayed(time);
    }

    /// End of the last cycle in which push and pull both succeeded.
    pub fn last_synced_time(&self) -> Option<DateTime<Utc>> {
        self.db.read(|t| t.last_sync_replay().last_synced_time)
    }

    /// Summary of outstanding work.
    pub fn status(&self) -> SyncStatus {
        let home = self.home_facility;
        self.db.read(|t| {
            let events = t.events();
            SyncStatus {
                home_facility: home,
                total_events: events.len(),
                pending_push: events.iter().filter(|e| !e.online_web_synced).count(),
                pending_replay: events
                    .iter()
                    .filter(|e| e.receiver_id == home && !e.local_replayed)
                    .count(),
                pending_export: events
                    .iter()
                    .filter(|e| e.receiver_id != home && !e.receiver_synced)
                    .count(),
                unshipped_acks: t.acks().iter().filter(|a| !a.shipped).count(),
                last_synced_time: t.last_sync_replay().last_synced_time,
                last_replayed_time: t.last_sync_replay().last_replayed_time,
                errors_since_last_sync: t.errors_since_last_sync().count(),
            }
        })
    }

    fn save_incoming(
        &self,
        txn: &mut Transaction<'_>,
        events: &[Event],
        online_web_synced: bool,
    ) -> Vec<EventId> {
        let mut new_ids = Vec::new();
        let mut acks = Vec::new();
        let mut seen = HashSet::new();

        for event in events {
            if !seen.insert(event.id) {
                continue;
            }
            if !txn.contains_event(&event.id) {
                let mut stored = event.for_transport();
                stored.online_web_synced = online_web_synced;
                txn.append_event(stored);
                new_ids.push(event.id);
            }
            if event.receiver_id == self.home_facility && txn.ack(&event.id).is_none() {
                acks.push(Ack::new(event.id));
            }
        }

        txn.put_acks(acks);
        new_ids
    }
}

/// Ids from `ids` that are stored and satisfy `predicate`, deduplicated.
fn pending(
    txn: &Transaction<'_>,
    ids: &[EventId],
    predicate: impl Fn(&Event) -> bool,
) -> Vec<EventId> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(**id))
        .filter(|id| txn.event(id).is_some_and(|e| predicate(&e)))
        .copied()
        .collect()
}
