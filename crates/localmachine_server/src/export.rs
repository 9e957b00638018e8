//! Online export: the events a facility has not received, as a downloadable
//! zip of packed files, for carrying to a facility without network access.

use crate::compat::CompatibilityGate;
use crate::error::ServerResult;
use crate::event_log::CentralEventLog;
use chrono::{DateTime, Utc};
use localmachine_protocol::{
    pack_events, part_file_names, write_archive, ArchiveEntry, BusinessVersion, FacilityId,
};
use std::sync::Arc;
use tracing::info;

/// Builds export archives from the central event log.
pub struct OnlineExportService {
    log: Arc<CentralEventLog>,
    gate: Arc<CompatibilityGate>,
    capacity: usize,
}

impl OnlineExportService {
    /// Creates an export service packing files of at most `capacity` bytes.
    pub fn new(log: Arc<CentralEventLog>, gate: Arc<CompatibilityGate>, capacity: usize) -> Self {
        Self { log, gate, capacity }
    }

    /// Archive of every event `facility` has not received, filtered for an
    /// agent at `version`. Returns `None` when there is nothing to export.
    ///
    /// Files are named `<facility>_central_<yyyyMMddHHmmss>`, split into
    /// numbered parts when the events exceed one file.
    pub fn export_for(
        &self,
        facility: FacilityId,
        version: BusinessVersion,
        now: DateTime<Utc>,
    ) -> ServerResult<Option<Vec<u8>>> {
        let pending = self
            .log
            .pending_for(facility, 0, usize::MAX)
            .into_iter()
            .map(|l| l.event)
            .collect();
        let events = self.gate.filter(version, pending);
        if events.is_empty() {
            return Ok(None);
        }

        let files = pack_events(&events, self.capacity)?;
        let base = format!("{}_central_{}", facility, now.format("%Y%m%d%H%M%S"));
        let entries: Vec<ArchiveEntry> = part_file_names(&base, files.len())
            .into_iter()
            .zip(files)
            .map(|(name, file)| ArchiveEntry::new(name, file.into_bytes()))
            .collect();

        let archive = write_archive(&entries)?;
        info!(
            facility = %facility,
            events = events.len(),
            files = entries.len(),
            "built online export"
        );
        Ok(Some(archive))
    }
}
