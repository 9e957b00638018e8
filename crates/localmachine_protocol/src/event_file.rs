//! Capacity-bounded, checksummed event files.
//!
//! ## Layout
//!
//! ```text
//! | hex(sha256(body)) (64 ASCII) | '\n' | body |
//! body = { len u32 BE | CBOR(event) }*
//! ```
//!
//! The checksum is verified before any record is decoded, so a flipped byte
//! shows up as [`ProtocolError::ChecksumMismatch`] rather than as a decode
//! error. The length prefixes make truncation detectable even without the
//! checksum.
//!
//! Capacity bounds the whole file including the checksum line. A block only
//! exceeds capacity when it holds exactly one event that is larger than the
//! capacity on its own.

use crate::codec::{from_cbor, to_cbor};
use crate::error::{ProtocolError, ProtocolResult};
use crate::event::{Event, EventId};
use sha2::{Digest, Sha256};

/// Required suffix of packed event files.
pub const EVENT_FILE_SUFFIX: &str = ".dat";

/// Length of the hex checksum line.
pub const CHECKSUM_LEN: usize = 64;

/// Byte separating the checksum from the body.
pub const CHECKSUM_DELIMITER: u8 = b'\n';

const HEADER_LEN: usize = CHECKSUM_LEN + 1;
const RECORD_PREFIX_LEN: usize = 4;

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Incrementally packs events into one block of bounded size.
///
/// The packer is reused across blocks: [`finish`](Self::finish) hands out the
/// current block and starts an empty one.
#[derive(Debug)]
pub struct EventResourcePacker {
    capacity: usize,
    body: Vec<u8>,
    event_ids: Vec<EventId>,
}

impl EventResourcePacker {
    /// Creates a packer producing blocks of at most `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            body: Vec::new(),
            event_ids: Vec::new(),
        }
    }

    /// Configured capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if the current block holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event_ids.is_empty()
    }

    /// Ids of the events in the current block, in write order.
    #[must_use]
    pub fn event_ids(&self) -> &[EventId] {
        &self.event_ids
    }

    /// Size the current block would have if finished now.
    #[must_use]
    pub fn current_size(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Bytes left before the block reaches capacity. Negative when a single
    /// oversized event has been written.
    #[must_use]
    pub fn remaining_capacity(&self) -> i64 {
        self.capacity as i64 - self.current_size() as i64
    }

    /// Serializes `event` into the current block and returns the remaining
    /// capacity.
    ///
    /// When the result is `<= 0` the caller should [`finish`](Self::finish)
    /// the block before writing more.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CapacityExceeded`] without writing anything if
    /// the block already holds events and this one does not fit.
    pub fn write_event_and_get_remaining_capacity(&mut self, event: &Event) -> ProtocolResult<i64> {
        let record = to_cbor(&event.for_transport())?;
        let record_len = RECORD_PREFIX_LEN + record.len();
        let remaining = self.remaining_capacity();

        if !self.is_empty() && record_len as i64 > remaining {
            return Err(ProtocolError::CapacityExceeded {
                event_len: record_len,
                remaining,
            });
        }

        self.body
            .extend_from_slice(&(record.len() as u32).to_be_bytes());
        self.body.extend_from_slice(&record);
        self.event_ids.push(event.id);
        Ok(self.remaining_capacity())
    }

    /// Discards the current block.
    pub fn reset(&mut self) {
        self.body.clear();
        self.event_ids.clear();
    }

    /// Completes the current block and starts a new one.
    pub fn finish(&mut self) -> EventFile {
        let body = std::mem::take(&mut self.body);
        let event_ids = std::mem::take(&mut self.event_ids);

        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(sha256_hex(&body).as_bytes());
        bytes.push(CHECKSUM_DELIMITER);
        bytes.extend_from_slice(&body);

        EventFile { bytes, event_ids }
    }
}

/// One finished, checksummed block of events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFile {
    bytes: Vec<u8>,
    event_ids: Vec<EventId>,
}

impl EventFile {
    /// Raw file content.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the file, returning its content.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// File size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the file carries no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event_ids.is_empty()
    }

    /// Ids of the packed events, in order.
    #[must_use]
    pub fn event_ids(&self) -> &[EventId] {
        &self.event_ids
    }

    /// The checksum line.
    #[must_use]
    pub fn checksum(&self) -> &str {
        std::str::from_utf8(&self.bytes[..CHECKSUM_LEN]).unwrap_or_default()
    }

    /// Verifies the checksum of packed file content and returns the body.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MalformedFile`] if there is no checksum line,
    /// [`ProtocolError::ChecksumMismatch`] if the body does not match it.
    pub fn verify(bytes: &[u8]) -> ProtocolResult<&[u8]> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::MalformedFile(format!(
                "{} bytes is shorter than the checksum header",
                bytes.len()
            )));
        }
        if bytes[CHECKSUM_LEN] != CHECKSUM_DELIMITER {
            return Err(ProtocolError::MalformedFile(
                "missing checksum delimiter".into(),
            ));
        }

        let expected = std::str::from_utf8(&bytes[..CHECKSUM_LEN])
            .map_err(|_| ProtocolError::MalformedFile("checksum is not ASCII".into()))?
            .to_ascii_lowercase();
        let body = &bytes[HEADER_LEN..];
        let actual = sha256_hex(body);

        if expected != actual {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }
        Ok(body)
    }

    /// Verifies and decodes packed file content into events.
    ///
    /// Decoded events carry cleared local flags; the receiver sets its own.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Vec<Event>> {
        let body = Self::verify(bytes)?;
        let mut events = Vec::new();
        let mut offset = 0usize;

        while offset < body.len() {
            let available = body.len() - offset;
            if available < RECORD_PREFIX_LEN {
                return Err(ProtocolError::Truncated {
                    offset,
                    needed: RECORD_PREFIX_LEN,
                    available,
                });
            }
            let len = u32::from_be_bytes([
                body[offset],
                body[offset + 1],
                body[offset + 2],
                body[offset + 3],
            ]) as usize;
            let start = offset + RECORD_PREFIX_LEN;
            if body.len() - start < len {
                return Err(ProtocolError::Truncated {
                    offset,
                    needed: len,
                    available: body.len() - start,
                });
            }

            let event: Event = from_cbor(&body[start..start + len])?;
            events.push(event.for_transport());
            offset = start + len;
        }

        Ok(events)
    }

    /// Decodes this file's own content.
    pub fn events(&self) -> ProtocolResult<Vec<Event>> {
        Self::decode(&self.bytes)
    }

    /// Rejects names that do not carry [`EVENT_FILE_SUFFIX`].
    pub fn check_name(name: &str) -> ProtocolResult<()> {
        if name.ends_with(EVENT_FILE_SUFFIX) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidSuffix {
                name: name.to_string(),
                expected: EVENT_FILE_SUFFIX,
            })
        }
    }
}

/// Packs `events` in order into blocks of at most `capacity` bytes.
///
/// Returns no blocks for no events. An event larger than `capacity` gets a
/// block of its own.
pub fn pack_events<'a, I>(events: I, capacity: usize) -> ProtocolResult<Vec<EventFile>>
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut packer = EventResourcePacker::new(capacity);
    let mut files = Vec::new();

    for event in events {
        let remaining = match packer.write_event_and_get_remaining_capacity(event) {
            Ok(remaining) => remaining,
            Err(ProtocolError::CapacityExceeded { .. }) => {
                files.push(packer.finish());
                packer.write_event_and_get_remaining_capacity(event)?
            }
            Err(e) => return Err(e),
        };
        if remaining <= 0 {
            files.push(packer.finish());
        }
    }

    if !packer.is_empty() {
        files.push(packer.finish());
    }
    Ok(files)
}

/// File names for a unit split into `parts` files.
///
/// One part keeps the plain `base.dat`; more parts are numbered
/// `base_1_of_N.dat` through `base_N_of_N.dat`. Every part carries its
/// number, not only the first, so a receiver holding any single part knows
/// the set is incomplete and the parts never collide on `base.dat`.
pub fn part_file_names(base: &str, parts: usize) -> Vec<String> {
    if parts <= 1 {
        return vec![format!("{base}{EVENT_FILE_SUFFIX}")];
    }
    (1..=parts)
        .map(|i| format!("{base}_{i}_of_{parts}{EVENT_FILE_SUFFIX}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, FacilityId};
    use proptest::prelude::*;

    fn event_with_payload(size: usize) -> Event {
        Event::new(
            "group",
            "STOCK_MOVED",
            EventPayload::new(1, vec![7u8; size]),
            FacilityId::new(),
            FacilityId::new(),
        )
    }

    fn encoded_len(event: &Event) -> usize {
        RECORD_PREFIX_LEN + to_cbor(&event.for_transport()).unwrap().len()
    }

    #[test]
    fn empty_input_packs_to_nothing() {
        assert!(pack_events(&[], 1024).unwrap().is_empty());
    }

    #[test]
    fn events_decode_in_order() {
        let events: Vec<_> = (0..5).map(|_| event_with_payload(16)).collect();
        let files = pack_events(&events, 1 << 20).unwrap();

        assert_eq!(files.len(), 1);
        let decoded = files[0].events().unwrap();
        let ids: Vec<_> = decoded.iter().map(|e| e.id).collect();
        let expected: Vec<_> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, expected);
        assert_eq!(files[0].event_ids(), expected.as_slice());
    }

    #[test]
    fn three_events_two_fit_yields_two_blocks() {
        let events: Vec<_> = (0..3).map(|_| event_with_payload(100)).collect();
        let per_event = encoded_len(&events[0]);
        let capacity = HEADER_LEN + 2 * per_event + per_event / 2;

        let files = pack_events(&events, capacity).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].event_ids(), &[events[0].id, events[1].id]);
        assert_eq!(files[1].event_ids(), &[events[2].id]);
        assert!(files.iter().all(|f| f.len() <= capacity));
    }

    #[test]
    fn oversized_event_gets_its_own_block() {
        let small = event_with_payload(10);
        let big = event_with_payload(4096);
        let capacity = HEADER_LEN + encoded_len(&small) * 2;

        let files = pack_events([&small, &big, &small], capacity).unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[1].event_ids(), &[big.id]);
        assert!(files[1].len() > capacity);
        assert_eq!(files[1].events().unwrap()[0].payload, big.payload);
    }

    #[test]
    fn refused_event_leaves_block_untouched() {
        let first = event_with_payload(50);
        let second = event_with_payload(50);
        let mut packer = EventResourcePacker::new(HEADER_LEN + encoded_len(&first) + 1);

        packer.write_event_and_get_remaining_capacity(&first).unwrap();
        let size_before = packer.current_size();
        let err = packer
            .write_event_and_get_remaining_capacity(&second)
            .unwrap_err();

        assert!(matches!(err, ProtocolError::CapacityExceeded { .. }));
        assert_eq!(packer.current_size(), size_before);
        assert_eq!(packer.event_ids(), &[first.id]);
    }

    #[test]
    fn reset_clears_block() {
        let mut packer = EventResourcePacker::new(1024);
        packer
            .write_event_and_get_remaining_capacity(&event_with_payload(8))
            .unwrap();
        packer.reset();
        assert!(packer.is_empty());
        assert_eq!(packer.remaining_capacity(), (1024 - HEADER_LEN) as i64);
    }

    #[test]
    fn local_flags_are_not_packed() {
        let mut event = event_with_payload(4);
        event.local_replayed = true;
        event.online_web_synced = true;

        let files = pack_events([&event], 1024).unwrap();
        let decoded = &files[0].events().unwrap()[0];
        assert!(!decoded.local_replayed);
        assert!(!decoded.online_web_synced);
    }

    #[test]
    fn flipped_byte_is_a_checksum_mismatch() {
        let files = pack_events([&event_with_payload(32)], 1024).unwrap();
        let mut bytes = files[0].as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        assert!(matches!(
            EventFile::decode(&bytes),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn header_only_garbage_is_malformed() {
        assert!(matches!(
            EventFile::decode(b"short"),
            Err(ProtocolError::MalformedFile(_))
        ));
    }

    #[test]
    fn checksum_matches_body() {
        let files = pack_events([&event_with_payload(32)], 1024).unwrap();
        let file = &files[0];
        assert_eq!(file.checksum(), sha256_hex(&file.as_bytes()[HEADER_LEN..]));
    }

    #[test]
    fn truncated_record_detected_even_with_valid_checksum() {
        let body = [0u8, 0, 0, 9, 1, 2];
        let mut bytes = sha256_hex(&body).into_bytes();
        bytes.push(CHECKSUM_DELIMITER);
        bytes.extend_from_slice(&body);

        assert!(matches!(
            EventFile::decode(&bytes),
            Err(ProtocolError::Truncated { offset: 0, needed: 9, available: 2 })
        ));
    }

    #[test]
    fn part_names() {
        assert_eq!(part_file_names("A_B_20240101000000", 1), vec!["A_B_20240101000000.dat"]);
        assert_eq!(
            part_file_names("x", 3),
            vec!["x_1_of_3.dat", "x_2_of_3.dat", "x_3_of_3.dat"]
        );
    }

    #[test]
    fn suffix_check() {
        assert!(EventFile::check_name("a_1_of_2.dat").is_ok());
        assert!(matches!(
            EventFile::check_name("a.txt"),
            Err(ProtocolError::InvalidSuffix { .. })
        ));
    }

    proptest! {
        #[test]
        fn blocks_respect_capacity(
            sizes in prop::collection::vec(0usize..600, 1..30),
            capacity in 200usize..2000,
        ) {
            let events: Vec<_> = sizes.iter().map(|&s| event_with_payload(s)).collect();
            let files = pack_events(&events, capacity).unwrap();

            let mut ids = Vec::new();
            for file in &files {
                prop_assert!(!file.is_empty());
                prop_assert!(file.len() <= capacity || file.event_ids().len() == 1);
                ids.extend_from_slice(file.event_ids());
            }
            let expected: Vec<_> = events.iter().map(|e| e.id).collect();
            prop_assert_eq!(ids, expected);
        }
    }
}
