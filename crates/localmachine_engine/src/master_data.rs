//! Master-data resync on the agent side.
//!
//! The agent keeps no offset of its own. A resync asks the web service for
//! the latest snapshot (which resets the facility's offset there), installs
//! the snapshot and then walks the delta stream page by page, confirming the
//! highest applied id after each page. A catch-up without a resync continues
//! from wherever the web service's offset stands.
//!
//! A facility without network access installs a master-data file instead:
//! the same snapshot and deltas, checksummed, carried by hand.

use crate::config::AgentConfig;
use crate::error::{SyncError, SyncResult};
use crate::lock::{LockGuard, LockProvider};
use crate::transport::OnlineWebClient;
use localmachine_protocol::{
    read_archive, sha256_hex, ConfirmOffsetRequest, MasterDataDeltasRequest, MasterDataFile,
    MasterDataRecord, MasterDataResyncRequest, MasterDataResyncResponse,
};
use localmachine_storage::NamedLocks;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Installs master data into local reference tables.
pub trait MasterDataApplier: Send + Sync {
    /// Replaces all reference tables with the content of a snapshot archive.
    fn apply_snapshot(
        &self,
        archive: &[u8],
        resync: &MasterDataResyncResponse,
    ) -> Result<(), String>;

    /// Applies deltas, in id order.
    fn apply_deltas(&self, records: &[MasterDataRecord]) -> Result<(), String>;
}

/// What a resync or catch-up did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterDataReport {
    /// Snapshot installed, if this was a resync.
    pub snapshot_version: Option<String>,
    /// Deltas applied.
    pub deltas_applied: usize,
    /// Offset confirmed last, if any.
    pub offset: Option<i64>,
}

/// Drives master-data resync against the web service.
pub struct MasterDataSyncer<C: OnlineWebClient> {
    config: AgentConfig,
    client: C,
    applier: Arc<dyn MasterDataApplier>,
    locks: Arc<dyn LockProvider>,
}

impl<C: OnlineWebClient> MasterDataSyncer<C> {
    /// Creates a syncer.
    pub fn new(config: AgentConfig, client: C, applier: Arc<dyn MasterDataApplier>) -> Self {
        Self {
            config,
            client,
            applier,
            locks: Arc::new(NamedLocks::new()),
        }
    }

    /// Uses `locks` for the resync lock.
    pub fn with_lock_provider(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = locks;
        self
    }

    /// Installs the latest snapshot and catches up on its deltas.
    ///
    /// # Errors
    ///
    /// [`SyncError::UnableGetLock`] if another resync holds the lock past the
    /// configured wait, [`SyncError::FileIntegrity`] if the snapshot does not
    /// match its checksum, and any transport or applier failure.
    pub fn resync(&self) -> SyncResult<MasterDataReport> {
        let _guard = self.lock()?;

        let response = self.client.master_data_resync(&MasterDataResyncRequest {
            facility_id: self.config.home_facility,
            agent_version: self.config.agent_version,
        })?;
        info!(
            version = %response.snapshot_version,
            snapshot_record = response.latest_snapshot_record_id,
            latest_delta = response.latest_delta_record_id,
            "master data resync started"
        );

        let archive = self.client.download_snapshot(&response.snapshot_download_url)?;
        let actual = sha256_hex(&archive);
        if actual != response.snapshot_checksum {
            warn!(version = %response.snapshot_version, "snapshot checksum mismatch");
            return Err(SyncError::FileIntegrity {
                file: response.snapshot_version.clone(),
                reason: format!(
                    "checksum mismatch: expected {}, got {actual}",
                    response.snapshot_checksum
                ),
            });
        }

        self.applier
            .apply_snapshot(&archive, &response)
            .map_err(SyncError::MasterData)?;

        let mut report = self.catch_up_locked()?;
        report.snapshot_version = Some(response.snapshot_version);
        Ok(report)
    }

    /// Installs a master-data file exported by the web service.
    ///
    /// Nothing is applied unless both checksums match and the file was built
    /// for this facility. No offset is confirmed: the web service moved it
    /// past the file's deltas when it built the file.
    ///
    /// # Errors
    ///
    /// [`SyncError::FileIntegrity`] for a damaged file,
    /// [`SyncError::FacilityMismatch`] for another facility's file,
    /// [`SyncError::UnableGetLock`] if a resync is running.
    pub fn import_snapshot_file(&self, bytes: &[u8]) -> SyncResult<MasterDataReport> {
        let _guard = self.lock()?;

        let file = MasterDataFile::decode(bytes).map_err(|e| {
            warn!(error = %e, "master data file rejected");
            SyncError::FileIntegrity {
                file: "master data file".into(),
                reason: e.to_string(),
            }
        })?;
        let resync = &file.manifest.resync;
        if file.manifest.facility_id != self.config.home_facility {
            return Err(SyncError::FacilityMismatch {
                file: resync.snapshot_version.clone(),
                expected: self.config.home_facility,
                actual: file.manifest.facility_id,
            });
        }

        self.applier
            .apply_snapshot(&file.snapshot, resync)
            .map_err(SyncError::MasterData)?;
        if !file.deltas.is_empty() {
            self.applier
                .apply_deltas(&file.deltas)
                .map_err(SyncError::MasterData)?;
        }

        info!(
            version = %resync.snapshot_version,
            deltas = file.deltas.len(),
            "master data file installed"
        );
        Ok(MasterDataReport {
            snapshot_version: Some(resync.snapshot_version.clone()),
            deltas_applied: file.deltas.len(),
            offset: None,
        })
    }

    /// Applies every delta past the confirmed offset.
    pub fn catch_up(&self) -> SyncResult<MasterDataReport> {
        let _guard = self.lock()?;
        self.catch_up_locked()
    }

    fn lock(&self) -> SyncResult<Box<dyn LockGuard>> {
        let name = &self.config.resync_lock_name;
        let wait = self.config.resync_lock_wait;
        self.locks
            .try_lock(name, wait)
            .ok_or_else(|| SyncError::UnableGetLock {
                name: name.clone(),
                waited: wait,
            })
    }

    fn catch_up_locked(&self) -> SyncResult<MasterDataReport> {
        let mut report = MasterDataReport::default();

        loop {
            let page = self.client.master_data_deltas(&MasterDataDeltasRequest {
                facility_id: self.config.home_facility,
                agent_version: self.config.agent_version,
                limit: self.config.delta_page_limit,
            })?;

            if let Some(last) = page.records.iter().map(|r| r.id).max() {
                self.applier
                    .apply_deltas(&page.records)
                    .map_err(SyncError::MasterData)?;

                let confirmed = self.client.confirm_offset(&ConfirmOffsetRequest {
                    facility_id: self.config.home_facility,
                    agent_version: self.config.agent_version,
                    record_offset: last,
                    snapshot_version: page.snapshot_version.clone(),
                })?;
                report.deltas_applied += page.records.len();
                report.offset = Some(confirmed.record_offset);
                debug!(
                    records = page.records.len(),
                    offset = confirmed.record_offset,
                    "applied master data deltas"
                );
            }

            if !page.has_more || page.records.is_empty() {
                break;
            }
        }

        info!(
            deltas = report.deltas_applied,
            offset = ?report.offset,
            "master data caught up"
        );
        Ok(report)
    }
}

/// Reference tables held in memory: the snapshot's table dumps with deltas
/// appended per table.
#[derive(Debug, Default)]
pub struct InMemoryMasterData {
    state: RwLock<MasterDataState>,
}

#[derive(Debug, Default)]
struct MasterDataState {
    version: Option<String>,
    tables: BTreeMap<String, Vec<u8>>,
    deltas: Vec<MasterDataRecord>,
}

impl InMemoryMasterData {
    /// Creates empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installed snapshot version.
    pub fn version(&self) -> Option<String> {
        self.state.read().version.clone()
    }

    /// Dump of `table` from the installed snapshot.
    pub fn table(&self, table: &str) -> Option<Vec<u8>> {
        self.state.read().tables.get(table).cloned()
    }

    /// Deltas applied since the snapshot.
    pub fn deltas(&self) -> Vec<MasterDataRecord> {
        self.state.read().deltas.clone()
    }
}

impl MasterDataApplier for InMemoryMasterData {
    fn apply_snapshot(
        &self,
        archive: &[u8],
        resync: &MasterDataResyncResponse,
    ) -> Result<(), String> {
        let entries = read_archive(archive).map_err(|e| e.to_string())?;
        let mut state = self.state.write();
        state.version = Some(resync.snapshot_version.clone());
        state.tables = entries.into_iter().map(|e| (e.name, e.data)).collect();
        state.deltas.clear();
        Ok(())
    }

    fn apply_deltas(&self, records: &[MasterDataRecord]) -> Result<(), String> {
        let mut state = self.state.write();
        if let (Some(last), Some(first)) = (state.deltas.last(), records.first()) {
            if first.id <= last.id {
                return Err(format!(
                    "delta {} is not after already applied delta {}",
                    first.id, last.id
                ));
            }
        }
        state.deltas.extend_from_slice(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockWebClient;
    use localmachine_protocol::{
        write_archive, ArchiveEntry, FacilityId, MasterDataDeltasResponse,
    };
    use std::time::Duration;

    fn snapshot() -> Vec<u8> {
        write_archive(&[
            ArchiveEntry::new("products.csv", b"id,name\n1,ORS\n".to_vec()),
            ArchiveEntry::new("facilities.csv", b"id,code\n".to_vec()),
        ])
        .unwrap()
    }

    fn resync_response(archive: &[u8]) -> MasterDataResyncResponse {
        MasterDataResyncResponse {
            latest_snapshot_record_id: 10,
            latest_delta_record_id: 13,
            snapshot_download_url: "/masterData/snapshots/v1".into(),
            snapshot_version: "v1".into(),
            schema_version: 1,
            snapshot_checksum: sha256_hex(archive),
        }
    }

    fn page(ids: &[i64], has_more: bool) -> MasterDataDeltasResponse {
        MasterDataDeltasResponse {
            records: ids
                .iter()
                .map(|id| MasterDataRecord::delta(*id, "products", id.to_string()))
                .collect(),
            has_more,
            snapshot_version: "v1".into(),
        }
    }

    fn syncer(
        mock: &Arc<MockWebClient>,
        tables: &Arc<InMemoryMasterData>,
    ) -> MasterDataSyncer<Arc<MockWebClient>> {
        let config = AgentConfig::new(FacilityId::new(), "http://central").with_delta_page_limit(2);
        MasterDataSyncer::new(config, Arc::clone(mock), tables.clone())
    }

    #[test]
    fn resync_installs_snapshot_and_walks_deltas() {
        let mock = Arc::new(MockWebClient::new());
        let tables = Arc::new(InMemoryMasterData::new());
        let archive = snapshot();
        mock.queue_resync(Ok(resync_response(&archive)));
        mock.put_snapshot("/masterData/snapshots/v1", archive);
        mock.queue_deltas(Ok(page(&[11, 12], true)));
        mock.queue_deltas(Ok(page(&[13], false)));

        let report = syncer(&mock, &tables).resync().unwrap();

        assert_eq!(report.snapshot_version.as_deref(), Some("v1"));
        assert_eq!(report.deltas_applied, 3);
        assert_eq!(report.offset, Some(13));
        assert_eq!(tables.version().as_deref(), Some("v1"));
        assert_eq!(tables.table("products.csv").unwrap(), b"id,name\n1,ORS\n");
        let offsets: Vec<i64> = mock
            .confirmed_offsets()
            .iter()
            .map(|r| r.record_offset)
            .collect();
        assert_eq!(offsets, vec![12, 13]);
    }

    #[test]
    fn checksum_mismatch_rejects_snapshot() {
        let mock = Arc::new(MockWebClient::new());
        let tables = Arc::new(InMemoryMasterData::new());
        let archive = snapshot();
        let mut response = resync_response(&archive);
        response.snapshot_checksum = "0".repeat(64);
        mock.queue_resync(Ok(response));
        mock.put_snapshot("/masterData/snapshots/v1", archive);

        let err = syncer(&mock, &tables).resync().unwrap_err();
        assert!(matches!(err, SyncError::FileIntegrity { .. }));
        assert!(tables.version().is_none());
    }

    #[test]
    fn busy_lock_is_an_error() {
        let mock = Arc::new(MockWebClient::new());
        let tables = Arc::new(InMemoryMasterData::new());
        let locks = Arc::new(NamedLocks::new());
        let config = AgentConfig::new(FacilityId::new(), "http://central")
            .with_resync_lock_wait(Duration::from_millis(10));
        let _held = locks
            .try_acquire(&config.resync_lock_name, Duration::ZERO)
            .unwrap();
        let syncer = MasterDataSyncer::new(config, Arc::clone(&mock), tables)
            .with_lock_provider(locks.clone());

        assert!(matches!(
            syncer.resync(),
            Err(SyncError::UnableGetLock { .. })
        ));
    }

    #[test]
    fn catch_up_with_nothing_new() {
        let mock = Arc::new(MockWebClient::new());
        let tables = Arc::new(InMemoryMasterData::new());
        mock.queue_deltas(Ok(page(&[], false)));

        let report = syncer(&mock, &tables).catch_up().unwrap();
        assert_eq!(report, MasterDataReport::default());
        assert!(mock.confirmed_offsets().is_empty());
    }

    fn master_data_file(facility: FacilityId) -> MasterDataFile {
        let archive = snapshot();
        MasterDataFile::new(
            facility,
            resync_response(&archive),
            archive,
            vec![
                MasterDataRecord::delta(11, "products", "2,Zinc"),
                MasterDataRecord::delta(12, "products", "3,Amoxicillin"),
            ],
            chrono::Utc::now(),
        )
    }

    #[test]
    fn master_data_file_installs_snapshot_and_deltas() {
        let mock = Arc::new(MockWebClient::new());
        let tables = Arc::new(InMemoryMasterData::new());
        let syncer = syncer(&mock, &tables);
        let bytes = master_data_file(syncer.config.home_facility).encode().unwrap();

        let report = syncer.import_snapshot_file(&bytes).unwrap();

        assert_eq!(report.snapshot_version.as_deref(), Some("v1"));
        assert_eq!(report.deltas_applied, 2);
        assert_eq!(report.offset, None);
        assert_eq!(tables.version().as_deref(), Some("v1"));
        assert_eq!(tables.table("products.csv").unwrap(), b"id,name\n1,ORS\n");
        assert_eq!(tables.deltas().iter().map(|r| r.id).collect::<Vec<_>>(), vec![11, 12]);
        assert!(mock.confirmed_offsets().is_empty());
    }

    #[test]
    fn corrupted_master_data_file_is_rejected() {
        let mock = Arc::new(MockWebClient::new());
        let tables = Arc::new(InMemoryMasterData::new());
        let syncer = syncer(&mock, &tables);

        let mut file = master_data_file(syncer.config.home_facility);
        file.snapshot.extend_from_slice(b"tampered");
        let err = syncer
            .import_snapshot_file(&file.encode().unwrap())
            .unwrap_err();
        assert!(matches!(err, SyncError::FileIntegrity { .. }));

        let mut bytes = master_data_file(syncer.config.home_facility).encode().unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(matches!(
            syncer.import_snapshot_file(&bytes),
            Err(SyncError::FileIntegrity { .. })
        ));
        assert!(tables.version().is_none());
    }

    #[test]
    fn master_data_file_for_another_facility_is_rejected() {
        let mock = Arc::new(MockWebClient::new());
        let tables = Arc::new(InMemoryMasterData::new());
        let bytes = master_data_file(FacilityId::new()).encode().unwrap();

        assert!(matches!(
            syncer(&mock, &tables).import_snapshot_file(&bytes),
            Err(SyncError::FacilityMismatch { .. })
        ));
        assert!(tables.version().is_none());
    }

    #[test]
    fn out_of_order_deltas_are_refused() {
        let tables = InMemoryMasterData::new();
        tables
            .apply_deltas(&[MasterDataRecord::delta(5, "t", vec![])])
            .unwrap();
        assert!(tables
            .apply_deltas(&[MasterDataRecord::delta(4, "t", vec![])])
            .is_err());
    }
}
