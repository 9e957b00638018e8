//! Master-data snapshots, delta stream and per-facility offsets.
//!
//! Every change to a reference table appends a delta record with the next
//! id. A snapshot dumps all tables into a zip, stores it under a
//! content-addressed version and appends a checkpoint record. A facility's
//! offset is relative to the snapshot it last installed: a resync resets it
//! to 0 against the latest snapshot, and the facility is then served every
//! delta above `max(offset, snapshot record id)`, never skipping one.
//!
//! A facility without network access gets the same content as a master-data
//! file: the latest snapshot plus every delta above it, checksummed. Building
//! the file resyncs the facility and moves its offset to the last delta in
//! the file, so the next online catch-up resumes right after it. A file that
//! is never installed is recovered by a resync.
//!
//! Records, the snapshot index and offsets live in memory; a restart of the
//! service starts from an empty delta stream and every facility resyncs.
//!
//! Cleanup removes records and snapshots below
//! `min(latest snapshot id, lowest effective offset)` and always keeps the
//! latest snapshot.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::snapshot_store::SnapshotStore;
use chrono::{DateTime, Utc};
use localmachine_protocol::{
    endpoints, sha256_hex, write_archive, ArchiveEntry, ConfirmOffsetResponse, FacilityId,
    MasterDataDeltasResponse, MasterDataFile, MasterDataRecord, MasterDataResyncResponse,
    SnapshotInfo,
};
use localmachine_storage::NamedLocks;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Supplies the current content of the reference tables.
pub trait MasterDataSource: Send + Sync {
    /// Dumps every reference table, one archive entry per table.
    fn dump_tables(&self) -> ServerResult<Vec<ArchiveEntry>>;
}

/// Reference tables held in memory.
#[derive(Default)]
pub struct InMemoryMasterDataSource {
    tables: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryMasterDataSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the dump of `table`.
    pub fn set_table(&self, table: impl Into<String>, dump: impl Into<Vec<u8>>) {
        self.tables.write().insert(table.into(), dump.into());
    }
}

impl MasterDataSource for InMemoryMasterDataSource {
    fn dump_tables(&self) -> ServerResult<Vec<ArchiveEntry>> {
        Ok(self
            .tables
            .read()
            .iter()
            .map(|(name, dump)| ArchiveEntry::new(name.clone(), dump.clone()))
            .collect())
    }
}

/// A facility's watermark into the delta stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterDataOffset {
    /// Facility.
    pub facility_id: FacilityId,
    /// Highest delta id the facility confirmed; 0 right after a resync.
    pub record_offset: i64,
    /// Snapshot the offset is relative to.
    pub snapshot_version: String,
    /// Checkpoint record id of that snapshot.
    pub snapshot_record_id: i64,
}

impl MasterDataOffset {
    /// Highest record id the facility already has.
    pub fn effective(&self) -> i64 {
        self.record_offset.max(self.snapshot_record_id)
    }
}

/// What a cleanup removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Records are kept above this id.
    pub bound: i64,
    /// Delta and checkpoint records removed.
    pub records_removed: usize,
    /// Snapshot archives removed.
    pub snapshots_removed: Vec<String>,
}

#[derive(Default)]
struct MasterDataState {
    next_id: i64,
    records: Vec<MasterDataRecord>,
    snapshots: Vec<SnapshotInfo>,
    offsets: HashMap<FacilityId, MasterDataOffset>,
}

impl MasterDataState {
    fn latest_id(&self) -> i64 {
        self.records.last().map(|r| r.id).unwrap_or(0)
    }

    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// The master-data subsystem of the central service.
pub struct MasterDataService {
    config: ServerConfig,
    source: Arc<dyn MasterDataSource>,
    store: Arc<dyn SnapshotStore>,
    locks: NamedLocks,
    groups: RwLock<HashMap<FacilityId, String>>,
    snapshot_guard: Mutex<()>,
    state: RwLock<MasterDataState>,
}

impl MasterDataService {
    /// Creates the service.
    pub fn new(
        config: ServerConfig,
        source: Arc<dyn MasterDataSource>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            locks: NamedLocks::new(),
            groups: RwLock::new(HashMap::new()),
            snapshot_guard: Mutex::new(()),
            state: RwLock::new(MasterDataState::default()),
        }
    }

    /// Uses `locks` for resync locks.
    pub fn with_locks(mut self, locks: NamedLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Places `facility` into a resync group. Facilities of one group
    /// resync one at a time; ungrouped facilities form a group of their own.
    pub fn assign_group(&self, facility: FacilityId, group: impl Into<String>) {
        self.groups.write().insert(facility, group.into());
    }

    /// Name of the resync lock for `facility`.
    pub fn lock_name(&self, facility: FacilityId) -> String {
        let group = self
            .groups
            .read()
            .get(&facility)
            .cloned()
            .unwrap_or_else(|| facility.to_string());
        format!("master data resync for {group}")
    }

    /// Appends a delta for `table`. Returns its record id.
    pub fn record_change(&self, table: impl Into<String>, payload: impl Into<Vec<u8>>) -> i64 {
        let mut state = self.state.write();
        let id = state.allocate_id();
        state
            .records
            .push(MasterDataRecord::delta(id, table, payload));
        id
    }

    /// Dumps the reference tables into a new snapshot.
    ///
    /// The version is `<yyyyMMddHHmmss>-<first 12 hex of the sha256>`.
    pub fn create_snapshot(&self, now: DateTime<Utc>) -> ServerResult<SnapshotInfo> {
        let _serial = self.snapshot_guard.lock();

        let archive = write_archive(&self.source.dump_tables()?)?;
        let checksum = sha256_hex(&archive);
        let version = format!("{}-{}", now.format("%Y%m%d%H%M%S"), &checksum[..12]);
        self.store.put(&version, &archive)?;

        let mut state = self.state.write();
        let record_id = state.allocate_id();
        let mut checkpoint = MasterDataRecord::checkpoint(record_id, version.clone());
        checkpoint.occurred_time = now;
        state.records.push(checkpoint);

        let info = SnapshotInfo {
            record_id,
            version,
            checksum,
            size: archive.len() as u64,
            created_time: now,
        };
        state.snapshots.push(info.clone());
        info!(version = %info.version, record_id, size = info.size, "created master data snapshot");
        Ok(info)
    }

    /// The most recent snapshot.
    pub fn latest_snapshot(&self) -> Option<SnapshotInfo> {
        self.state.read().snapshots.last().cloned()
    }

    /// Snapshot archive by version.
    pub fn snapshot_archive(&self, version: &str) -> ServerResult<Vec<u8>> {
        self.store
            .get(version)?
            .ok_or_else(|| ServerError::NotFound(format!("snapshot {version}")))
    }

    /// Points `facility` at the latest snapshot and resets its offset.
    ///
    /// Creates a first snapshot when none exists. Holds the facility
    /// group's lock throughout.
    ///
    /// # Errors
    ///
    /// [`ServerError::UnableGetLock`] if the group's lock stays busy for the
    /// configured wait.
    pub fn resync(&self, facility: FacilityId, now: DateTime<Utc>) -> ServerResult<MasterDataResyncResponse> {
        let name = self.lock_name(facility);
        let wait = self.config.resync_lock_wait;
        let Some(_guard) = self.locks.try_acquire(&name, wait) else {
            warn!(facility = %facility, lock = %name, "resync lock busy");
            return Err(ServerError::UnableGetLock { name, waited: wait });
        };

        let snapshot = match self.latest_snapshot() {
            Some(snapshot) => snapshot,
            None => self.create_snapshot(now)?,
        };

        let mut state = self.state.write();
        state.offsets.insert(
            facility,
            MasterDataOffset {
                facility_id: facility,
                record_offset: 0,
                snapshot_version: snapshot.version.clone(),
                snapshot_record_id: snapshot.record_id,
            },
        );
        let latest_delta_record_id = state.latest_id();
        info!(facility = %facility, version = %snapshot.version, "facility resynced master data");

        Ok(MasterDataResyncResponse {
            latest_snapshot_record_id: snapshot.record_id,
            latest_delta_record_id,
            snapshot_download_url: format!(
                "{}{}{}",
                self.config.public_url,
                endpoints::SNAPSHOTS,
                snapshot.version
            ),
            snapshot_version: snapshot.version,
            schema_version: self.config.schema_version,
            snapshot_checksum: snapshot.checksum,
        })
    }

    /// The next page of deltas above the facility's effective offset.
    pub fn deltas_for(&self, facility: FacilityId, limit: u32) -> ServerResult<MasterDataDeltasResponse> {
        let limit = limit.clamp(1, self.config.max_delta_page) as usize;
        let state = self.state.read();
        let offset = state
            .offsets
            .get(&facility)
            .ok_or_else(|| ServerError::NoOffset(facility.to_string()))?;
        let after = offset.effective();

        let mut pending = state
            .records
            .iter()
            .filter(|r| r.id > after && !r.is_snapshot());
        let records: Vec<MasterDataRecord> = pending.by_ref().take(limit).cloned().collect();
        let has_more = pending.next().is_some();

        debug!(facility = %facility, after, records = records.len(), has_more, "served deltas");
        Ok(MasterDataDeltasResponse {
            records,
            has_more,
            snapshot_version: offset.snapshot_version.clone(),
        })
    }

    /// Advances the facility's offset. Never moves it backwards.
    pub fn confirm_offset(
        &self,
        facility: FacilityId,
        record_offset: i64,
        snapshot_version: &str,
    ) -> ServerResult<ConfirmOffsetResponse> {
        let mut state = self.state.write();
        let latest = state.latest_id();
        let offset = state
            .offsets
            .get_mut(&facility)
            .ok_or_else(|| ServerError::NoOffset(facility.to_string()))?;

        if offset.snapshot_version != snapshot_version {
            return Err(ServerError::InvalidRequest(format!(
                "offset confirmed against snapshot {snapshot_version}, facility is on {}",
                offset.snapshot_version
            )));
        }
        if record_offset > latest {
            return Err(ServerError::InvalidRequest(format!(
                "offset {record_offset} is past the latest record {latest}"
            )));
        }

        offset.record_offset = offset.record_offset.max(record_offset);
        Ok(ConfirmOffsetResponse {
            record_offset: offset.record_offset,
        })
    }

    /// Current offset of a facility.
    pub fn offset(&self, facility: FacilityId) -> Option<MasterDataOffset> {
        self.state.read().offsets.get(&facility).cloned()
    }

    /// All records currently retained.
    pub fn records(&self) -> Vec<MasterDataRecord> {
        self.state.read().records.clone()
    }

    /// Builds the master-data file for a facility that syncs by hand.
    ///
    /// Resyncs `facility` and bundles the latest snapshot with every delta
    /// recorded after it. The facility's offset is moved to the last delta
    /// in the file.
    pub fn export_file(&self, facility: FacilityId, now: DateTime<Utc>) -> ServerResult<Vec<u8>> {
        let resync = self.resync(facility, now)?;
        let snapshot = self.snapshot_archive(&resync.snapshot_version)?;
        let after = resync.latest_snapshot_record_id;

        let deltas: Vec<MasterDataRecord> = {
            let mut state = self.state.write();
            let deltas: Vec<MasterDataRecord> = state
                .records
                .iter()
                .filter(|r| r.id > after && !r.is_snapshot())
                .cloned()
                .collect();
            if let (Some(last), Some(offset)) = (deltas.last(), state.offsets.get_mut(&facility)) {
                if offset.snapshot_version == resync.snapshot_version {
                    offset.record_offset = offset.record_offset.max(last.id);
                }
            }
            deltas
        };

        info!(
            facility = %facility,
            version = %resync.snapshot_version,
            deltas = deltas.len(),
            "exported master data file"
        );
        Ok(MasterDataFile::new(facility, resync, snapshot, deltas, now).encode()?)
    }

    /// Removes records and snapshots no facility needs any more.
    pub fn cleanup(&self) -> ServerResult<CleanupReport> {
        let _serial = self.snapshot_guard.lock();
        let mut state = self.state.write();

        let Some(latest) = state.snapshots.last().cloned() else {
            return Ok(CleanupReport::default());
        };
        let bound = state
            .offsets
            .values()
            .map(MasterDataOffset::effective)
            .fold(latest.record_id, i64::min);

        let before = state.records.len();
        state
            .records
            .retain(|r| r.id > bound || r.id == latest.record_id);
        let records_removed = before - state.records.len();

        let (stale, kept): (Vec<SnapshotInfo>, Vec<SnapshotInfo>) = state
            .snapshots
            .drain(..)
            .partition(|s| s.record_id < bound && s.record_id != latest.record_id);
        state.snapshots = kept;
        drop(state);

        let mut snapshots_removed = Vec::new();
        for snapshot in stale {
            self.store.remove(&snapshot.version)?;
            snapshots_removed.push(snapshot.version);
        }

        info!(
            bound,
            records_removed,
            snapshots_removed = snapshots_removed.len(),
            "master data cleanup"
        );
        Ok(CleanupReport {
            bound,
            records_removed,
            snapshots_removed,
        })
    }
}
