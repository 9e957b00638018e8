//! Export and import commands.

use super::{open_store, CliResult};
use chrono::Utc;
use localmachine_engine::{
    ErrorRecorder, EventImporter, EventStore, LocalDatabase, LocalExportService, LocalImportService,
    ReplayDispatch, StaticFacilityDirectory,
};
use localmachine_protocol::{EventId, FacilityId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Writes an export archive for every facility with unacknowledged events.
///
/// Returns the archive path, or `None` when there was nothing to export.
pub fn export(
    journal: &Path,
    home: FacilityId,
    out: &Path,
    facilities: &[(FacilityId, String)],
    capacity: usize,
) -> CliResult<Option<PathBuf>> {
    let store = open_store(journal, home)?;
    let directory = facilities
        .iter()
        .fold(StaticFacilityDirectory::new(), |dir, (id, code)| {
            dir.with_facility(*id, code.clone(), code.clone())
        });
    std::fs::create_dir_all(out)?;

    let service = LocalExportService::new(store, Arc::new(directory), capacity);
    let path = service.export_to(out, Utc::now())?;
    match &path {
        Some(path) => println!("Wrote {}", path.display()),
        None => println!("Nothing to export"),
    }
    Ok(path)
}

/// Stores the events of `archive` without replaying them.
///
/// Returns the ids new to the journal.
pub fn import(journal: &Path, home: FacilityId, archive: &Path) -> CliResult<Vec<EventId>> {
    let bytes = std::fs::read(archive)?;
    let db = Arc::new(LocalDatabase::open(journal)?);
    let store = EventStore::new(Arc::clone(&db), home);
    let errors = ErrorRecorder::new(db);
    let importer = EventImporter::new(store.clone(), errors.clone(), ReplayDispatch::new());

    let new_ids = LocalImportService::new(store, errors, importer).receive_archive(&bytes)?;
    info!(archive = %archive.display(), new = new_ids.len(), "imported archive");
    println!(
        "Stored {} new event(s) from {}",
        new_ids.len(),
        archive.display()
    );
    Ok(new_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use localmachine_protocol::EventPayload;

    fn emit(journal: &Path, home: FacilityId, receiver: FacilityId) -> EventId {
        let store = EventStore::new(Arc::new(LocalDatabase::open(journal).unwrap()), home);
        store
            .transaction(|txn| {
                Ok(store
                    .emit(txn, "o-1", "ORDER", EventPayload::new(1, vec![7; 16]), receiver)
                    .id)
            })
            .unwrap()
    }

    #[test]
    fn export_then_import() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (FacilityId::new(), FacilityId::new());
        let journal_a = dir.path().join("a.journal");
        let journal_b = dir.path().join("b.journal");
        let id = emit(&journal_a, a, b);

        let codes = vec![(a, "HC01".to_string()), (b, "DH02".to_string())];
        let archive = export(&journal_a, a, &dir.path().join("out"), &codes, 1 << 20)
            .unwrap()
            .unwrap();
        let name = archive.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("HC01_"), "{name}");

        assert_eq!(import(&journal_b, b, &archive).unwrap(), vec![id]);
        assert!(import(&journal_b, b, &archive).unwrap().is_empty());
    }

    #[test]
    fn nothing_to_export() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join("a.journal");
        LocalDatabase::open(&journal).unwrap();

        let path = export(&journal, FacilityId::new(), dir.path(), &[], 1 << 20).unwrap();
        assert!(path.is_none());
    }
}
