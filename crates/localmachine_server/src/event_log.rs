//! Central event log.
//!
//! Holds every event pushed by any agent, in arrival order, deduplicated by
//! id. An event is `received` once its receiver attests durable storage,
//! either by an ack or by pushing the event itself. Acks are queued for the
//! event's sender and handed out on every exchange until the sender confirms
//! them. An ack that arrives before its event is parked and applied when
//! the event shows up.
//!
//! The log lives in memory. Restarting the service loses events that were
//! pushed but not yet peered, along with queued acks; those events still
//! reach their receiver through an archive export from the sender's journal.

use localmachine_protocol::{Ack, Event, EventId, FacilityId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// An event held by the central service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    /// 1-based arrival position; the peering cursor.
    pub position: u64,
    /// The event in wire form.
    pub event: Event,
    /// The receiver has stored the event.
    pub received: bool,
}

/// Result of appending a pushed block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Ids now held by the log: new ones and duplicates.
    pub accepted: Vec<EventId>,
    /// Events that were already held.
    pub duplicates: u32,
}

#[derive(Default)]
struct LogState {
    events: Vec<LoggedEvent>,
    index: HashMap<EventId, usize>,
    /// Unconfirmed acks per sender, by event id.
    outgoing_acks: HashMap<FacilityId, BTreeMap<EventId, Ack>>,
    /// Acks for events not seen yet, with the facility that sent them.
    early_acks: HashMap<EventId, FacilityId>,
}

impl LogState {
    fn mark_received(&mut self, slot: usize) {
        let logged = &mut self.events[slot];
        if logged.received {
            return;
        }
        logged.received = true;
        let sender = logged.event.sender_id;
        let id = logged.event.id;
        self.outgoing_acks
            .entry(sender)
            .or_default()
            .insert(id, Ack::new(id));
    }
}

/// The central, deduplicated event log.
#[derive(Default)]
pub struct CentralEventLog {
    state: RwLock<LogState>,
}

impl CentralEventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends events pushed by `pusher`.
    ///
    /// Known ids count as duplicates and are accepted again. An event pushed
    /// by its own receiver is already stored there and counts as received.
    pub fn append(&self, pusher: FacilityId, events: Vec<Event>) -> AppendOutcome {
        let mut state = self.state.write();
        let mut outcome = AppendOutcome::default();

        for event in events {
            let id = event.id;
            outcome.accepted.push(id);

            if let Some(&slot) = state.index.get(&id) {
                outcome.duplicates += 1;
                if state.events[slot].event.receiver_id == pusher {
                    state.mark_received(slot);
                }
                continue;
            }

            let slot = state.events.len();
            let receiver = event.receiver_id;
            state.events.push(LoggedEvent {
                position: slot as u64 + 1,
                event: event.for_transport(),
                received: false,
            });
            state.index.insert(id, slot);

            let early = state.early_acks.remove(&id);
            if receiver == pusher || early == Some(receiver) {
                state.mark_received(slot);
            }
        }

        debug!(
            pusher = %pusher,
            accepted = outcome.accepted.len(),
            duplicates = outcome.duplicates,
            "appended events"
        );
        outcome
    }

    /// Events addressed to `facility` after `cursor` that it has not
    /// received, in arrival order, at most `limit`.
    pub fn pending_for(&self, facility: FacilityId, cursor: u64, limit: usize) -> Vec<LoggedEvent> {
        let state = self.state.read();
        let start = cursor.min(state.events.len() as u64) as usize;
        state.events[start..]
            .iter()
            .filter(|l| !l.received && l.event.receiver_id == facility)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Applies acks sent by `from` for events addressed to it.
    ///
    /// Acks for events addressed elsewhere are ignored.
    pub fn receive_acks(&self, from: FacilityId, acks: &[Ack]) {
        let mut state = self.state.write();
        for ack in acks {
            match state.index.get(&ack.event_id).copied() {
                Some(slot) if state.events[slot].event.receiver_id == from => {
                    state.mark_received(slot);
                }
                Some(_) => {}
                None => {
                    state.early_acks.insert(ack.event_id, from);
                }
            }
        }
    }

    /// Acks waiting for `sender`, in event id order.
    pub fn acks_for(&self, sender: FacilityId) -> Vec<Ack> {
        self.state
            .read()
            .outgoing_acks
            .get(&sender)
            .map(|acks| acks.values().copied().collect())
            .unwrap_or_default()
    }

    /// Drops acks `sender` confirmed. Returns how many were dropped.
    pub fn confirm_acks(&self, sender: FacilityId, event_ids: &[EventId]) -> usize {
        let mut state = self.state.write();
        let Some(acks) = state.outgoing_acks.get_mut(&sender) else {
            return 0;
        };
        let before = acks.len();
        for id in event_ids {
            acks.remove(id);
        }
        before - acks.len()
    }

    /// Looks up an event.
    pub fn get(&self, id: &EventId) -> Option<LoggedEvent> {
        let state = self.state.read();
        state.index.get(id).map(|&slot| state.events[slot].clone())
    }

    /// Number of events held.
    pub fn len(&self) -> usize {
        self.state.read().events.len()
    }

    /// Returns true if the log holds no events.
    pub fn is_empty(&self) -> bool {
        self.state.read().events.is_empty()
    }
}
