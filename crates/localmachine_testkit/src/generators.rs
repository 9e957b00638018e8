//! Property-based test generators using proptest.
//!
//! Provides strategies for events, batches and versions that keep the
//! routing invariants of real traffic: every generated event has a fresh
//! id and all local sync flags cleared.

use localmachine_protocol::{BusinessVersion, Event, EventPayload, FacilityId};
use proptest::prelude::*;
use uuid::Uuid;

/// Strategy for generating facility ids.
pub fn facility_id_strategy() -> impl Strategy<Value = FacilityId> {
    any::<u128>().prop_map(|bits| FacilityId::from_uuid(Uuid::from_u128(bits)))
}

/// Strategy for generating event categories.
pub fn category_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][A-Z_]{2,23}").expect("Invalid regex")
}

/// Strategy for generating opaque payloads of up to `max_len` bytes.
pub fn payload_strategy(max_len: usize) -> impl Strategy<Value = EventPayload> {
    (1u32..5, prop::collection::vec(any::<u8>(), 0..=max_len))
        .prop_map(|(version, bytes)| EventPayload::new(version, bytes))
}

/// Strategy for generating one event from `sender` to `receiver`.
pub fn event_strategy(
    sender: FacilityId,
    receiver: FacilityId,
    max_payload: usize,
) -> impl Strategy<Value = Event> {
    (
        prop::string::string_regex("[a-z0-9-]{1,16}").expect("Invalid regex"),
        category_strategy(),
        payload_strategy(max_payload),
    )
        .prop_map(move |(group, category, payload)| {
            Event::new(group, category, payload, sender, receiver)
        })
}

/// Strategy for generating a batch of events from `sender` addressed to
/// one of `receivers`.
pub fn event_batch_strategy(
    sender: FacilityId,
    receivers: Vec<FacilityId>,
    max_events: usize,
    max_payload: usize,
) -> impl Strategy<Value = Vec<Event>> {
    let receivers_len = receivers.len().max(1);
    prop::collection::vec(
        (0..receivers_len, payload_strategy(max_payload), category_strategy()),
        0..=max_events,
    )
    .prop_map(move |specs| {
        specs
            .into_iter()
            .map(|(r, payload, category)| {
                let receiver = receivers.get(r).copied().unwrap_or(sender);
                Event::new("batch", category, payload, sender, receiver)
            })
            .collect()
    })
}

/// Strategy for generating business versions.
pub fn business_version_strategy() -> impl Strategy<Value = BusinessVersion> {
    (0u32..5, 0u32..20, 0u32..50)
        .prop_map(|(major, minor, patch)| BusinessVersion::new(major, minor, patch))
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn generated_events_are_fresh(event in event_strategy(FacilityId::new(), FacilityId::new(), 64)) {
            prop_assert!(!event.local_replayed);
            prop_assert!(!event.online_web_synced);
            prop_assert!(!event.receiver_synced);
            prop_assert!(event.payload.bytes.len() <= 64);
        }

        #[test]
        fn batches_use_given_receivers(
            events in event_batch_strategy(
                FacilityId::from_uuid(Uuid::from_u128(1)),
                vec![FacilityId::from_uuid(Uuid::from_u128(2))],
                8,
                16,
            )
        ) {
            for event in &events {
                prop_assert_eq!(event.receiver_id, FacilityId::from_uuid(Uuid::from_u128(2)));
            }
        }

        #[test]
        fn category_is_upper_snake(category in category_strategy()) {
            prop_assert!(category.chars().all(|c| c.is_ascii_uppercase() || c == '_'));
        }
    }
}
