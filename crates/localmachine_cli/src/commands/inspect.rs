//! Inspect command implementation.

use super::{load_entries, CliResult, OutputFormat};
use chrono::{DateTime, Utc};
use localmachine_protocol::{ArchiveEntry, EventFile, ProtocolResult, CHECKSUM_LEN};
use serde::Serialize;
use std::path::Path;

/// Inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Inspected path.
    pub path: String,
    /// One summary per packed file.
    pub files: Vec<FileSummary>,
}

/// Contents of one packed file.
#[derive(Debug, Serialize)]
pub struct FileSummary {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: usize,
    /// Checksum line.
    pub checksum: String,
    /// Events in file order.
    pub events: Vec<EventSummary>,
}

/// One event, without its payload bytes.
#[derive(Debug, Serialize)]
pub struct EventSummary {
    /// Event id.
    pub id: String,
    /// Business grouping key.
    pub group_id: String,
    /// Category.
    pub category: String,
    /// Emitting facility.
    pub sender: String,
    /// Destination facility.
    pub receiver: String,
    /// Payload schema version.
    pub payload_version: u32,
    /// Payload size in bytes.
    pub payload_size: usize,
    /// Occurrence time at the emitter.
    pub occurred_time: DateTime<Utc>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: OutputFormat) -> CliResult<()> {
    let result = inspect(path)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_text_output(&result),
    }
    Ok(())
}

/// Summarizes every packed file at `path`.
pub fn inspect(path: &Path) -> CliResult<InspectResult> {
    let files = load_entries(path)?
        .iter()
        .map(summarize)
        .collect::<ProtocolResult<Vec<_>>>()?;
    Ok(InspectResult {
        path: path.display().to_string(),
        files,
    })
}

fn summarize(entry: &ArchiveEntry) -> ProtocolResult<FileSummary> {
    let events = EventFile::decode(&entry.data)?;
    let checksum = String::from_utf8_lossy(&entry.data[..CHECKSUM_LEN]).into_owned();

    Ok(FileSummary {
        name: entry.name.clone(),
        size: entry.data.len(),
        checksum,
        events: events
            .into_iter()
            .map(|e| EventSummary {
                id: e.id.to_string(),
                group_id: e.group_id,
                category: e.category,
                sender: e.sender_id.to_string(),
                receiver: e.receiver_id.to_string(),
                payload_version: e.payload.version,
                payload_size: e.payload.bytes.len(),
                occurred_time: e.occurred_time,
            })
            .collect(),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("{}", result.path);
    for file in &result.files {
        println!();
        println!("{} ({} bytes, {} events)", file.name, file.size, file.events.len());
        println!("  checksum: {}", file.checksum);
        for e in &file.events {
            println!(
                "  {} {:<24} v{} {:>8}B  {} -> {}  [{}] {}",
                e.id,
                e.category,
                e.payload_version,
                e.payload_size,
                e.sender,
                e.receiver,
                e.group_id,
                e.occurred_time.format("%Y-%m-%d %H:%M:%S"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localmachine_protocol::{
        pack_events, write_archive, Event, EventPayload, FacilityId,
    };

    #[test]
    fn inspects_archive() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (FacilityId::new(), FacilityId::new());
        let events = vec![
            Event::new("o-1", "ORDER", EventPayload::new(2, vec![0; 10]), a, b),
            Event::new("o-1", "SHIPMENT", EventPayload::new(1, vec![0; 3]), a, b),
        ];
        let file = pack_events(&events, usize::MAX).unwrap().remove(0);
        let archive = write_archive(&[ArchiveEntry::new("B_A_20240101000000.dat", file.into_bytes())])
            .unwrap();
        let path = dir.path().join("A_20240101000000.zip");
        std::fs::write(&path, archive).unwrap();

        let result = inspect(&path).unwrap();
        assert_eq!(result.files.len(), 1);
        let summary = &result.files[0];
        assert_eq!(summary.name, "B_A_20240101000000.dat");
        assert_eq!(summary.events.len(), 2);
        assert_eq!(summary.events[0].category, "ORDER");
        assert_eq!(summary.events[0].payload_size, 10);
        assert_eq!(summary.events[1].receiver, b.to_string());
    }

    #[test]
    fn corrupted_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.dat");
        std::fs::write(&path, b"not a packed file").unwrap();
        assert!(inspect(&path).is_err());
    }
}
