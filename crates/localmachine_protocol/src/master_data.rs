//! Master-data replication records and the file that carries master data
//! to a facility without network access.

use crate::archive::{read_archive, write_archive, ArchiveEntry};
use crate::codec::{from_cbor, to_cbor};
use crate::error::{ProtocolError, ProtocolResult};
use crate::event::FacilityId;
use crate::event_file::sha256_hex;
use crate::messages::MasterDataResyncResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Archive entry holding the [`MasterDataManifest`].
pub const MASTER_DATA_MANIFEST: &str = "manifest.cbor";

/// Archive entry holding the snapshot zip.
pub const MASTER_DATA_SNAPSHOT: &str = "snapshot.zip";

/// Archive entry holding the deltas recorded after the snapshot.
pub const MASTER_DATA_DELTAS: &str = "deltas.cbor";

/// One entry of the master-data record stream.
///
/// Ids are strictly increasing. A record with a snapshot version is a
/// checkpoint: the named snapshot contains every change up to and including
/// it. All other records are deltas on top of the most recent checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterDataRecord {
    /// Monotonic record id.
    pub id: i64,
    /// Set on snapshot checkpoints.
    pub snapshot_version: Option<String>,
    /// When the change was recorded.
    pub occurred_time: DateTime<Utc>,
    /// Reference table the change belongs to (empty for checkpoints).
    pub table_name: String,
    /// Serialized row change.
    #[serde(with = "crate::codec::byte_buf")]
    pub payload: Vec<u8>,
}

impl MasterDataRecord {
    /// Creates a delta record.
    pub fn delta(id: i64, table_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            snapshot_version: None,
            occurred_time: Utc::now(),
            table_name: table_name.into(),
            payload: payload.into(),
        }
    }

    /// Creates a snapshot checkpoint record.
    pub fn checkpoint(id: i64, snapshot_version: impl Into<String>) -> Self {
        Self {
            id,
            snapshot_version: Some(snapshot_version.into()),
            occurred_time: Utc::now(),
            table_name: String::new(),
            payload: Vec::new(),
        }
    }

    /// Returns true for snapshot checkpoints.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.snapshot_version.is_some()
    }
}

/// Metadata of a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Id of the checkpoint record.
    pub record_id: i64,
    /// Content-addressed version name.
    pub version: String,
    /// Hex SHA-256 of the archive.
    pub checksum: String,
    /// Archive size in bytes.
    pub size: u64,
    /// When the snapshot was taken.
    pub created_time: DateTime<Utc>,
}

/// What a master-data file contains and how to check it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterDataManifest {
    /// Facility the file was built for.
    pub facility_id: FacilityId,
    /// Snapshot version, record ids and snapshot checksum, as a network
    /// resync would have returned them.
    pub resync: MasterDataResyncResponse,
    /// Hex SHA-256 of the deltas entry.
    pub deltas_checksum: String,
    /// When the file was built.
    pub created_time: DateTime<Utc>,
}

/// A master-data snapshot plus the deltas after it, bundled into one zip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterDataFile {
    /// Contents and checksums.
    pub manifest: MasterDataManifest,
    /// Snapshot archive.
    pub snapshot: Vec<u8>,
    /// Deltas above the snapshot, in id order.
    pub deltas: Vec<MasterDataRecord>,
}

impl MasterDataFile {
    /// Bundles `snapshot` and `deltas` for `facility_id`.
    ///
    /// The snapshot checksum is taken from `resync`; the deltas checksum is
    /// computed when the file is encoded.
    pub fn new(
        facility_id: FacilityId,
        resync: MasterDataResyncResponse,
        snapshot: Vec<u8>,
        deltas: Vec<MasterDataRecord>,
        created_time: DateTime<Utc>,
    ) -> Self {
        Self {
            manifest: MasterDataManifest {
                facility_id,
                resync,
                deltas_checksum: String::new(),
                created_time,
            },
            snapshot,
            deltas,
        }
    }

    /// Writes the zip: manifest, snapshot, deltas.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let deltas = to_cbor(&self.deltas)?;
        let mut manifest = self.manifest.clone();
        manifest.deltas_checksum = sha256_hex(&deltas);

        write_archive(&[
            ArchiveEntry::new(MASTER_DATA_MANIFEST, to_cbor(&manifest)?),
            ArchiveEntry::new(MASTER_DATA_SNAPSHOT, self.snapshot.clone()),
            ArchiveEntry::new(MASTER_DATA_DELTAS, deltas),
        ])
    }

    /// Reads a zip written by [`MasterDataFile::encode`].
    ///
    /// Both the snapshot and the deltas are checked against the manifest
    /// before the deltas are parsed.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut entries = read_archive(bytes)?;
        let mut take = |name: &str| -> ProtocolResult<Vec<u8>> {
            let index = entries
                .iter()
                .position(|e| e.name == name)
                .ok_or_else(|| ProtocolError::MalformedFile(format!("missing entry {name}")))?;
            Ok(entries.swap_remove(index).data)
        };
        let manifest: MasterDataManifest = from_cbor(&take(MASTER_DATA_MANIFEST)?)?;
        let snapshot = take(MASTER_DATA_SNAPSHOT)?;
        let deltas = take(MASTER_DATA_DELTAS)?;

        check(&manifest.resync.snapshot_checksum, &snapshot)?;
        check(&manifest.deltas_checksum, &deltas)?;

        Ok(Self {
            deltas: from_cbor(&deltas)?,
            manifest,
            snapshot,
        })
    }
}

fn check(expected: &str, data: &[u8]) -> ProtocolResult<()> {
    let actual = sha256_hex(data);
    if actual == expected {
        Ok(())
    } else {
        Err(ProtocolError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> MasterDataFile {
        let snapshot = write_archive(&[ArchiveEntry::new("products.csv", b"id\n1\n".to_vec())]).unwrap();
        let resync = MasterDataResyncResponse {
            latest_snapshot_record_id: 3,
            latest_delta_record_id: 5,
            snapshot_download_url: String::new(),
            snapshot_version: "20240101000000-abc".into(),
            schema_version: 1,
            snapshot_checksum: sha256_hex(&snapshot),
        };
        MasterDataFile::new(
            FacilityId::new(),
            resync,
            snapshot,
            vec![
                MasterDataRecord::delta(4, "products", b"2".to_vec()),
                MasterDataRecord::delta(5, "products", b"3".to_vec()),
            ],
            Utc::now(),
        )
    }

    #[test]
    fn master_data_file_survives_encoding() {
        let original = file();
        let decoded = MasterDataFile::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded.snapshot, original.snapshot);
        assert_eq!(decoded.deltas, original.deltas);
        assert_eq!(decoded.manifest.resync, original.manifest.resync);
        assert_eq!(decoded.manifest.deltas_checksum.len(), 64);
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let mut original = file();
        original.snapshot.push(0);
        assert!(matches!(
            MasterDataFile::decode(&original.encode().unwrap()),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn missing_entry_is_rejected() {
        let archive = write_archive(&[ArchiveEntry::new(MASTER_DATA_SNAPSHOT, vec![1])]).unwrap();
        assert!(matches!(
            MasterDataFile::decode(&archive),
            Err(ProtocolError::MalformedFile(_))
        ));
    }

    #[test]
    fn checkpoint_vs_delta() {
        assert!(MasterDataRecord::checkpoint(1, "20240101000000-abcd").is_snapshot());
        assert!(!MasterDataRecord::delta(2, "products", b"row".to_vec()).is_snapshot());
    }
}
