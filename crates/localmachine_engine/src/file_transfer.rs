//! File-based fallback: export events to a zip of packed files and import
//! them elsewhere.
//!
//! An export archive holds one or more `.dat` files per receiving facility.
//! Import validates the whole archive before anything is written: every
//! entry must carry the `.dat` suffix, pass its checksum, and name this
//! agent's home facility as the receiver of every event. One bad entry
//! rejects the archive.

use crate::error::{SyncError, SyncResult};
use crate::error_recorder::ErrorRecorder;
use crate::event_store::EventStore;
use crate::facility::FacilityDirectory;
use crate::importer::{EventImporter, ImportSummary, ReplayContext};
use crate::records::ErrorType;
use chrono::{DateTime, Utc};
use localmachine_protocol::{
    pack_events, part_file_names, read_archive, write_archive, ArchiveEntry, Event, EventFile,
    EventId, FacilityId, ProtocolError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// A built export archive.
#[derive(Debug, Clone)]
pub struct ExportArchive {
    /// Zip content.
    pub bytes: Vec<u8>,
    /// Names of the packed files inside, in order.
    pub files: Vec<String>,
    /// Events included.
    pub event_count: usize,
}

/// Exports events addressed to other facilities.
pub struct LocalExportService {
    store: EventStore,
    facilities: Arc<dyn FacilityDirectory>,
    capacity: usize,
}

impl LocalExportService {
    /// Creates an export service packing files of at most `capacity` bytes.
    pub fn new(store: EventStore, facilities: Arc<dyn FacilityDirectory>, capacity: usize) -> Self {
        Self {
            store,
            facilities,
            capacity,
        }
    }

    /// Builds an archive of every event not yet acknowledged by its
    /// receiver. Returns `None` when there is nothing to export.
    ///
    /// Exporting does not change any sync flag; an event stays exportable
    /// until its receiver's ack arrives.
    pub fn export(&self, now: DateTime<Utc>) -> SyncResult<Option<ExportArchive>> {
        let home = self.store.home_facility();
        let groups = self.store.get_events_for_export(home);
        if groups.is_empty() {
            return Ok(None);
        }

        let sender_code = self.facilities.code_of(home);
        let stamp = now.format("%Y%m%d%H%M%S");
        let mut entries = Vec::new();
        let mut event_count = 0;

        for (receiver, events) in &groups {
            let base = format!("{}_{}_{}", self.facilities.code_of(*receiver), sender_code, stamp);
            let files = pack_events(events, self.capacity)?;
            let names = part_file_names(&base, files.len());
            event_count += events.len();

            for (name, file) in names.into_iter().zip(files) {
                entries.push(ArchiveEntry::new(name, file.into_bytes()));
            }
        }

        let files = entries.iter().map(|e| e.name.clone()).collect();
        let bytes = write_archive(&entries)?;
        info!(
            receivers = groups.len(),
            files = entries.len(),
            events = event_count,
            bytes = bytes.len(),
            "built export archive"
        );

        Ok(Some(ExportArchive {
            bytes,
            files,
            event_count,
        }))
    }

    /// Writes an export archive into `dir` and returns its path, or `None`
    /// when there is nothing to export.
    pub fn export_to(&self, dir: &Path, now: DateTime<Utc>) -> SyncResult<Option<PathBuf>> {
        let Some(archive) = self.export(now)? else {
            return Ok(None);
        };
        let code = self.facilities.code_of(self.store.home_facility());
        let path = dir.join(format!("{}_{}.zip", code, now.format("%Y%m%d%H%M%S")));
        std::fs::write(&path, &archive.bytes)?;
        Ok(Some(path))
    }
}

/// Imports archives produced by [`LocalExportService`] at another facility.
pub struct LocalImportService {
    store: EventStore,
    errors: ErrorRecorder,
    importer: EventImporter,
}

impl LocalImportService {
    /// Creates an import service.
    pub fn new(store: EventStore, errors: ErrorRecorder, importer: EventImporter) -> Self {
        Self {
            store,
            errors,
            importer,
        }
    }

    /// Validates `archive` and stores its events without replaying them.
    ///
    /// Returns the ids that were new to this agent.
    pub fn receive_archive(&self, archive: &[u8]) -> SyncResult<Vec<EventId>> {
        let events = self.validate(archive)?;
        let new_ids = self
            .store
            .transaction(|txn| Ok(self.store.save_received_events(txn, &events)))?;
        info!(
            events = events.len(),
            new = new_ids.len(),
            "stored events from archive"
        );
        Ok(new_ids)
    }

    /// Validates `archive`, stores its events and replays them.
    pub fn import_archive(
        &self,
        archive: &[u8],
        context: &ReplayContext,
    ) -> SyncResult<ImportSummary> {
        let events = self.validate(archive)?;
        self.store
            .transaction(|txn| Ok(self.store.save_received_events(txn, &events)))?;
        self.importer.import_events(&events, context)
    }

    /// Decodes every entry, recording and returning the first failure.
    fn validate(&self, archive: &[u8]) -> SyncResult<Vec<Event>> {
        self.decode_all(archive).map_err(|(error_type, e, ids)| {
            warn!(error = %e, "rejected import archive");
            self.errors.record_quietly(error_type, &e, &ids);
            e
        })
    }

    fn decode_all(&self, archive: &[u8]) -> Result<Vec<Event>, (ErrorType, SyncError, Vec<EventId>)> {
        let home = self.store.home_facility();
        let entries = read_archive(archive).map_err(|e| {
            (
                ErrorType::FileIntegrity,
                SyncError::Archive(e.to_string()),
                Vec::new(),
            )
        })?;

        let mut events = Vec::new();
        for entry in entries {
            let decoded = EventFile::check_name(&entry.name)
                .and_then(|()| EventFile::decode(&entry.data))
                .map_err(|e| {
                    (
                        ErrorType::FileIntegrity,
                        integrity_error(&entry.name, e),
                        Vec::new(),
                    )
                })?;

            if let Some(foreign) = decoded.iter().find(|e| e.receiver_id != home) {
                let ids = decoded.iter().map(|e| e.id).collect();
                return Err((
                    ErrorType::FacilityMismatch,
                    mismatch_error(&entry.name, home, foreign.receiver_id),
                    ids,
                ));
            }
            events.extend(decoded);
        }
        Ok(events)
    }
}

fn integrity_error(file: &str, error: ProtocolError) -> SyncError {
    SyncError::FileIntegrity {
        file: file.to_string(),
        reason: error.to_string(),
    }
}

fn mismatch_error(file: &str, expected: FacilityId, actual: FacilityId) -> SyncError {
    SyncError::FacilityMismatch {
        file: file.to_string(),
        expected,
        actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::LocalDatabase;
    use crate::facility::StaticFacilityDirectory;
    use crate::importer::ReplayDispatch;
    use chrono::TimeZone;
    use localmachine_protocol::EventPayload;

    struct Agent {
        store: EventStore,
        errors: ErrorRecorder,
        home: FacilityId,
    }

    fn agent(home: FacilityId) -> Agent {
        let db = Arc::new(LocalDatabase::open_in_memory().unwrap());
        Agent {
            store: EventStore::new(Arc::clone(&db), home),
            errors: ErrorRecorder::new(db),
            home,
        }
    }

    fn import_service(agent: &Agent) -> LocalImportService {
        let dispatch = ReplayDispatch::new()
            .with_handler("ORDER", |_: &Event, _: &ReplayContext| -> Result<(), String> { Ok(()) });
        let importer = EventImporter::new(agent.store.clone(), agent.errors.clone(), dispatch);
        LocalImportService::new(agent.store.clone(), agent.errors.clone(), importer)
    }

    fn emit(agent: &Agent, receiver: FacilityId, size: usize) -> Event {
        agent
            .store
            .transaction(|txn| {
                Ok(agent
                    .store
                    .emit(txn, "g", "ORDER", EventPayload::new(1, vec![5u8; size]), receiver))
            })
            .unwrap()
    }

    fn directory(a: FacilityId, b: FacilityId) -> Arc<dyn FacilityDirectory> {
        Arc::new(
            StaticFacilityDirectory::new()
                .with_facility(a, "HC01", "Health Centre 1")
                .with_facility(b, "DH02", "District Hospital 2"),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap()
    }

    #[test]
    fn export_then_import_replays_once() {
        let sender = agent(FacilityId::new());
        let receiver = agent(FacilityId::new());
        let e1 = emit(&sender, receiver.home, 10);
        let e2 = emit(&sender, receiver.home, 10);

        let export = LocalExportService::new(
            sender.store.clone(),
            directory(sender.home, receiver.home),
            1 << 20,
        );
        let archive = export.export(now()).unwrap().unwrap();
        assert_eq!(archive.files, vec!["DH02_HC01_20240305140709.dat".to_string()]);
        assert_eq!(archive.event_count, 2);

        let import = import_service(&receiver);
        let ctx = ReplayContext::new(receiver.home);
        let first = import.import_archive(&archive.bytes, &ctx).unwrap();
        let second = import.import_archive(&archive.bytes, &ctx).unwrap();

        assert_eq!(first.replayed, 2);
        assert_eq!(second.replayed, 0);
        for id in [e1.id, e2.id] {
            let stored = receiver.store.get(&id).unwrap();
            assert!(stored.local_replayed);
            assert!(!stored.online_web_synced);
        }
        assert_eq!(receiver.store.get_not_shipped_acks().len(), 2);
    }

    #[test]
    fn multi_part_export_names() {
        let sender = agent(FacilityId::new());
        let receiver = FacilityId::new();
        for _ in 0..3 {
            emit(&sender, receiver, 400);
        }

        let export =
            LocalExportService::new(sender.store.clone(), directory(sender.home, receiver), 600);
        let archive = export.export(now()).unwrap().unwrap();

        assert_eq!(
            archive.files,
            vec![
                "DH02_HC01_20240305140709_1_of_3.dat",
                "DH02_HC01_20240305140709_2_of_3.dat",
                "DH02_HC01_20240305140709_3_of_3.dat",
            ]
        );
    }

    #[test]
    fn nothing_to_export() {
        let sender = agent(FacilityId::new());
        let export = LocalExportService::new(
            sender.store.clone(),
            Arc::new(StaticFacilityDirectory::new()),
            1 << 20,
        );
        assert!(export.export(now()).unwrap().is_none());
    }

    #[test]
    fn wrong_receiver_is_rejected_without_writes() {
        let sender = agent(FacilityId::new());
        let intended = FacilityId::new();
        let other = agent(FacilityId::new());
        let event = emit(&sender, intended, 10);

        let export =
            LocalExportService::new(sender.store.clone(), directory(sender.home, intended), 1 << 20);
        let archive = export.export(now()).unwrap().unwrap();

        let err = import_service(&other).receive_archive(&archive.bytes).unwrap_err();
        assert!(matches!(
            err,
            SyncError::FacilityMismatch { expected, actual, .. }
                if expected == other.home && actual == intended
        ));
        assert!(other.store.get(&event.id).is_none());

        let errors = other.errors.all();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, ErrorType::FacilityMismatch);
        assert_eq!(errors[0].payload.event_ids, vec![event.id]);
    }

    #[test]
    fn corrupted_entry_rejects_whole_archive() {
        let receiver = agent(FacilityId::new());
        let sender = FacilityId::new();
        let good = Event::new("g", "ORDER", EventPayload::new(1, vec![1]), sender, receiver.home);
        let bad = Event::new("g", "ORDER", EventPayload::new(1, vec![2]), sender, receiver.home);

        let good_file = pack_events([&good], 1 << 20).unwrap().remove(0).into_bytes();
        let mut bad_file = pack_events([&bad], 1 << 20).unwrap().remove(0).into_bytes();
        let last = bad_file.len() - 1;
        bad_file[last] ^= 0xFF;

        let archive = write_archive(&[
            ArchiveEntry::new("a.dat", good_file),
            ArchiveEntry::new("b.dat", bad_file),
        ])
        .unwrap();

        let err = import_service(&receiver).receive_archive(&archive).unwrap_err();
        assert!(matches!(err, SyncError::FileIntegrity { ref file, .. } if file == "b.dat"));
        assert!(receiver.store.get(&good.id).is_none());
        assert_eq!(receiver.errors.all()[0].error_type, ErrorType::FileIntegrity);
    }

    #[test]
    fn wrong_suffix_is_rejected() {
        let receiver = agent(FacilityId::new());
        let event = Event::new("g", "ORDER", EventPayload::new(1, vec![]), FacilityId::new(), receiver.home);
        let file = pack_events([&event], 1 << 20).unwrap().remove(0).into_bytes();
        let archive = write_archive(&[ArchiveEntry::new("events.txt", file)]).unwrap();

        assert!(matches!(
            import_service(&receiver).receive_archive(&archive),
            Err(SyncError::FileIntegrity { .. })
        ));
    }

    #[test]
    fn export_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sender = agent(FacilityId::new());
        let receiver = FacilityId::new();
        emit(&sender, receiver, 10);

        let export =
            LocalExportService::new(sender.store.clone(), directory(sender.home, receiver), 1 << 20);
        let path = export.export_to(dir.path(), now()).unwrap().unwrap();

        assert_eq!(path.file_name().unwrap(), "HC01_20240305140709.zip");
        let entries = read_archive(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
