//! Events and acks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of an event.
///
/// Assigned once by the emitting agent and never changed; every idempotency
/// decision in the system is keyed by it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a new random event id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a facility (the routing key for events).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FacilityId(Uuid);

impl FacilityId {
    /// Generates a new random facility id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FacilityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FacilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FacilityId({})", self.0)
    }
}

impl fmt::Display for FacilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FacilityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque, versioned business payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Payload schema version chosen by the producer.
    pub version: u32,
    /// Serialized business data.
    #[serde(with = "crate::codec::byte_buf")]
    pub bytes: Vec<u8>,
}

impl EventPayload {
    /// Creates a payload.
    pub fn new(version: u32, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            bytes: bytes.into(),
        }
    }
}

/// A business occurrence routed between facilities.
///
/// Identity and routing fields are fixed at creation. The three sync flags
/// only ever move from `false` to `true`; they describe the local copy and
/// are cleared by [`Event::for_transport`] before an event leaves the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id.
    pub id: EventId,
    /// Business grouping key (for example an order number).
    pub group_id: String,
    /// Category used to select the replay handler.
    pub category: String,
    /// Opaque payload.
    pub payload: EventPayload,
    /// When the occurrence happened at the emitter.
    pub occurred_time: DateTime<Utc>,
    /// Emitting facility.
    pub sender_id: FacilityId,
    /// Destination facility.
    pub receiver_id: FacilityId,
    /// Business effects applied locally.
    #[serde(default)]
    pub local_replayed: bool,
    /// Central web service holds this event.
    #[serde(default)]
    pub online_web_synced: bool,
    /// Receiver acknowledged durable storage.
    #[serde(default)]
    pub receiver_synced: bool,
}

impl Event {
    /// Creates a new event with a fresh id and all flags cleared.
    pub fn new(
        group_id: impl Into<String>,
        category: impl Into<String>,
        payload: EventPayload,
        sender_id: FacilityId,
        receiver_id: FacilityId,
    ) -> Self {
        Self {
            id: EventId::new(),
            group_id: group_id.into(),
            category: category.into(),
            payload,
            occurred_time: Utc::now(),
            sender_id,
            receiver_id,
            local_replayed: false,
            online_web_synced: false,
            receiver_synced: false,
        }
    }

    /// Sets the occurrence time.
    #[must_use]
    pub fn with_occurred_time(mut self, occurred_time: DateTime<Utc>) -> Self {
        self.occurred_time = occurred_time;
        self
    }

    /// Returns a copy with the local sync flags cleared.
    #[must_use]
    pub fn for_transport(&self) -> Self {
        Self {
            local_replayed: false,
            online_web_synced: false,
            receiver_synced: false,
            ..self.clone()
        }
    }

    /// Returns true if the event is addressed to `facility`.
    #[must_use]
    pub fn is_for(&self, facility: FacilityId) -> bool {
        self.receiver_id == facility
    }
}

/// A receipt: the receiver has durably stored the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ack {
    /// Acknowledged event.
    pub event_id: EventId,
    /// The ack reached the event's sender.
    #[serde(default)]
    pub shipped: bool,
}

impl Ack {
    /// Creates an unshipped ack.
    #[must_use]
    pub fn new(event_id: EventId) -> Self {
        Self {
            event_id,
            shipped: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{from_cbor, to_cbor};

    #[test]
    fn facility_id_parses_its_display() {
        let id = FacilityId::new();
        assert_eq!(id.to_string().parse::<FacilityId>().unwrap(), id);
        assert!("HC01".parse::<FacilityId>().is_err());
    }

    fn sample() -> Event {
        Event::new(
            "order-17",
            "ORDER_SHIPPED",
            EventPayload::new(2, b"{\"qty\":4}".to_vec()),
            FacilityId::new(),
            FacilityId::new(),
        )
    }

    #[test]
    fn event_id_formats() {
        let uuid = Uuid::nil();
        let id = EventId::from_uuid(uuid);
        assert_eq!(id.to_string(), uuid.to_string());
        assert_eq!(format!("{id:?}"), format!("EventId({uuid})"));
    }

    #[test]
    fn fresh_ids_differ() {
        assert_ne!(EventId::new(), EventId::new());
        assert_ne!(FacilityId::new(), FacilityId::new());
    }

    #[test]
    fn for_transport_clears_local_flags() {
        let mut event = sample();
        event.local_replayed = true;
        event.online_web_synced = true;
        event.receiver_synced = true;

        let wire = event.for_transport();
        assert!(!wire.local_replayed);
        assert!(!wire.online_web_synced);
        assert!(!wire.receiver_synced);
        assert_eq!(wire.id, event.id);
        assert_eq!(wire.payload, event.payload);
    }

    #[test]
    fn event_cbor_keeps_identity_and_flags() {
        let mut event = sample();
        event.online_web_synced = true;

        let decoded: Event = from_cbor(&to_cbor(&event).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn payload_bytes_are_a_byte_string() {
        let payload = EventPayload::new(1, vec![0xDE, 0xAD]);
        let bytes = to_cbor(&payload).unwrap();
        // 0x42 = CBOR byte string of length 2
        assert!(bytes.windows(3).any(|w| w == [0x42, 0xDE, 0xAD]));
    }

    #[test]
    fn ack_starts_unshipped() {
        let ack = Ack::new(EventId::new());
        assert!(!ack.shipped);
    }

    #[test]
    fn is_for_checks_receiver() {
        let event = sample();
        assert!(event.is_for(event.receiver_id));
        assert!(!event.is_for(event.sender_id));
    }
}
