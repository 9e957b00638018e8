//! Request/response messages exchanged between agents and the web service.
//!
//! Every message is a plain serde struct encoded as CBOR. Requests name the
//! calling facility and the agent's business version so the service can
//! route and gate its answers.

use crate::codec::{from_cbor, to_cbor};
use crate::error::ProtocolResult;
use crate::event::{Ack, EventId, FacilityId};
use crate::master_data::MasterDataRecord;
use crate::version::BusinessVersion;
use serde::{Deserialize, Serialize};

/// Endpoint paths.
pub mod endpoints {
    /// Push one packed block of events.
    pub const PUSH_EVENTS: &str = "/events";
    /// Fetch a page of events addressed to the caller.
    pub const PEERING_EVENTS: &str = "/peeringEvents";
    /// Swap outstanding acks.
    pub const ACK_EXCHANGE: &str = "/acks/exchange";
    /// Confirm acks received in an exchange.
    pub const CONFIRM_ACKS: &str = "/ack";
    /// Request a master-data resync.
    pub const MASTER_DATA_RESYNC: &str = "/masterData/resync";
    /// Fetch master-data deltas past the caller's offset.
    pub const MASTER_DATA_DELTAS: &str = "/masterData/deltas";
    /// Advance the caller's master-data offset.
    pub const MASTER_DATA_OFFSET: &str = "/masterData/offset";
    /// Prefix under which snapshots are downloadable.
    pub const SNAPSHOTS: &str = "/masterData/snapshots/";
    /// Prefix under which master-data files are downloadable, followed by
    /// the facility id.
    pub const MASTER_DATA_EXPORT: &str = "/masterData/export/";
}

macro_rules! cbor_message {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $ty {
                /// Encodes to CBOR.
                pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
                    to_cbor(self)
                }

                /// Decodes from CBOR.
                pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
                    from_cbor(bytes)
                }
            }
        )*
    };
}

/// Upload of one packed event block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEventsRequest {
    /// Calling facility.
    pub facility_id: FacilityId,
    /// Caller's business version.
    pub agent_version: BusinessVersion,
    /// Packed event file content.
    #[serde(with = "crate::codec::byte_buf")]
    pub file: Vec<u8>,
}

/// Result of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEventsResponse {
    /// Events the service now holds (new and already known).
    pub accepted: Vec<EventId>,
    /// Of those, how many were already known.
    pub duplicates: u32,
}

/// Request for events addressed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringEventsRequest {
    /// Calling facility.
    pub facility_id: FacilityId,
    /// Caller's business version.
    pub agent_version: BusinessVersion,
    /// Position to continue from; zero for the first page.
    pub cursor: u64,
}

/// One page of peering events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringEventsResponse {
    /// Packed event file; `None` when nothing is pending.
    #[serde(default, with = "crate::codec::opt_byte_buf")]
    pub file: Option<Vec<u8>>,
    /// Cursor for the next page.
    pub next_cursor: u64,
    /// More events are waiting past `next_cursor`.
    pub has_more: bool,
}

/// Swap of outstanding acks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckExchangeRequest {
    /// Calling facility.
    pub facility_id: FacilityId,
    /// Caller's business version.
    pub agent_version: BusinessVersion,
    /// Receipts for events the caller has stored.
    pub acks: Vec<Ack>,
}

/// Acks addressed to the caller as sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckExchangeResponse {
    /// Receipts for events the caller sent.
    pub acks: Vec<Ack>,
}

/// Confirms that acks returned by an exchange are durably applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmAcksRequest {
    /// Calling facility.
    pub facility_id: FacilityId,
    /// Caller's business version.
    pub agent_version: BusinessVersion,
    /// Events whose acks were applied.
    pub event_ids: Vec<EventId>,
}

/// Request to re-baseline master data on the latest snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterDataResyncRequest {
    /// Calling facility.
    pub facility_id: FacilityId,
    /// Caller's business version.
    pub agent_version: BusinessVersion,
}

/// Where to fetch the snapshot and where the delta stream stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterDataResyncResponse {
    /// Record id of the snapshot checkpoint.
    pub latest_snapshot_record_id: i64,
    /// Highest delta record id at the time of the request.
    pub latest_delta_record_id: i64,
    /// Location of the snapshot archive.
    pub snapshot_download_url: String,
    /// Snapshot version name.
    pub snapshot_version: String,
    /// Master-data schema version.
    pub schema_version: u32,
    /// Hex SHA-256 of the snapshot archive.
    pub snapshot_checksum: String,
}

/// Request for deltas past the caller's offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterDataDeltasRequest {
    /// Calling facility.
    pub facility_id: FacilityId,
    /// Caller's business version.
    pub agent_version: BusinessVersion,
    /// Maximum number of records to return.
    pub limit: u32,
}

/// One page of deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterDataDeltasResponse {
    /// Deltas in id order.
    pub records: Vec<MasterDataRecord>,
    /// More deltas are waiting.
    pub has_more: bool,
    /// Snapshot the offset is relative to.
    pub snapshot_version: String,
}

/// Advances the caller's master-data offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOffsetRequest {
    /// Calling facility.
    pub facility_id: FacilityId,
    /// Caller's business version.
    pub agent_version: BusinessVersion,
    /// Highest record id applied.
    pub record_offset: i64,
    /// Snapshot the offset is relative to.
    pub snapshot_version: String,
}

/// The stored offset after confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOffsetResponse {
    /// Current offset.
    pub record_offset: i64,
}

/// Error body returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP-style status code.
    pub status: u16,
    /// Stable error kind.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl ErrorResponse {
    /// Creates an error body.
    pub fn new(status: u16, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Server-side failures are worth retrying on the next cycle.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

cbor_message!(
    PushEventsRequest,
    PushEventsResponse,
    PeeringEventsRequest,
    PeeringEventsResponse,
    AckExchangeRequest,
    AckExchangeResponse,
    ConfirmAcksRequest,
    MasterDataResyncRequest,
    MasterDataResyncResponse,
    MasterDataDeltasRequest,
    MasterDataDeltasResponse,
    ConfirmOffsetRequest,
    ConfirmOffsetResponse,
    ErrorResponse,
);

#[cfg(test)]
mod tests {
    use super::*;

    fn version() -> BusinessVersion {
        BusinessVersion::new(2, 1, 0)
    }

    #[test]
    fn push_request_carries_file_bytes() {
        let request = PushEventsRequest {
            facility_id: FacilityId::new(),
            agent_version: version(),
            file: vec![1, 2, 3, 4],
        };
        let decoded = PushEventsRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn empty_peering_page() {
        let response = PeeringEventsResponse {
            file: None,
            next_cursor: 12,
            has_more: false,
        };
        let decoded = PeeringEventsResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn peering_page_with_file() {
        let response = PeeringEventsResponse {
            file: Some(b"abc".to_vec()),
            next_cursor: 3,
            has_more: true,
        };
        let decoded = PeeringEventsResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded.file.as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn resync_response_fields() {
        let response = MasterDataResyncResponse {
            latest_snapshot_record_id: 40,
            latest_delta_record_id: 57,
            snapshot_download_url: "http://central/masterData/snapshots/v1".into(),
            snapshot_version: "v1".into(),
            schema_version: 3,
            snapshot_checksum: "00".repeat(32),
        };
        let decoded = MasterDataResyncResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn decoding_wrong_message_fails() {
        let bytes = ConfirmOffsetResponse { record_offset: 1 }.encode().unwrap();
        assert!(PushEventsRequest::decode(&bytes).is_err());
    }

    #[test]
    fn server_errors_classified() {
        assert!(ErrorResponse::new(503, "Unavailable", "down").is_server_error());
        assert!(!ErrorResponse::new(409, "Conflict", "stale offset").is_server_error());
    }
}
