//! # localmachine protocol
//!
//! Pure protocol types for the localmachine offline-first event sync.
//!
//! This crate provides:
//! - [`Event`] and [`Ack`], the units exchanged between agents and the
//!   central web service
//! - [`EventResourcePacker`] / [`EventFile`], a capacity-bounded,
//!   checksummed packing of events into transportable blocks
//! - Request/response messages for every transport endpoint
//! - Master-data wire records and the checksummed master-data file
//! - In-memory zip archives bundling packed files
//! - [`BusinessVersion`] for agent compatibility checks
//!
//! Nothing here performs I/O. Event payloads are opaque: the engine routes
//! them by category and receiver and never looks inside.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod archive;
mod codec;
mod error;
mod event;
mod event_file;
mod master_data;
mod messages;
mod version;

pub use archive::{read_archive, write_archive, ArchiveEntry};
pub use codec::{from_cbor, to_cbor};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{Ack, Event, EventId, EventPayload, FacilityId};
pub use event_file::{
    pack_events, part_file_names, sha256_hex, EventFile, EventResourcePacker,
    CHECKSUM_DELIMITER, CHECKSUM_LEN, EVENT_FILE_SUFFIX,
};
pub use master_data::{
    MasterDataFile, MasterDataManifest, MasterDataRecord, SnapshotInfo, MASTER_DATA_DELTAS,
    MASTER_DATA_MANIFEST, MASTER_DATA_SNAPSHOT,
};
pub use messages::{
    endpoints, AckExchangeRequest, AckExchangeResponse, ConfirmAcksRequest,
    ConfirmOffsetRequest, ConfirmOffsetResponse, ErrorResponse, MasterDataDeltasRequest,
    MasterDataDeltasResponse, MasterDataResyncRequest, MasterDataResyncResponse,
    PeeringEventsRequest, PeeringEventsResponse, PushEventsRequest, PushEventsResponse,
};
pub use version::BusinessVersion;

/// Default capacity of one packed block on the network path (20 MiB).
pub const NETWORK_CAPACITY: usize = 20 * 1024 * 1024;

/// Default capacity of one packed file on the file-export path (50 MiB).
pub const EXPORT_CAPACITY: usize = 50 * 1024 * 1024;
