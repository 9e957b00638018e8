//! Status command implementation.

use super::{open_store, CliResult, OutputFormat};
use chrono::{DateTime, Utc};
use localmachine_engine::SyncStatus;
use localmachine_protocol::FacilityId;
use std::path::Path;

/// Runs the status command.
pub fn run(journal: &Path, home: FacilityId, format: OutputFormat) -> CliResult<()> {
    let status = open_store(journal, home)?.status();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => print_text_output(&status),
    }
    Ok(())
}

fn print_text_output(status: &SyncStatus) {
    println!("Facility:               {}", status.home_facility);
    println!("Events stored:          {}", status.total_events);
    println!("Pending push:           {}", status.pending_push);
    println!("Pending replay:         {}", status.pending_replay);
    println!("Awaiting receiver ack:  {}", status.pending_export);
    println!("Unshipped acks:         {}", status.unshipped_acks);
    println!("Last synced:            {}", time(status.last_synced_time));
    println!("Last replayed:          {}", time(status.last_replayed_time));
    println!("Errors since last sync: {}", status.errors_since_last_sync);
}

fn time(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use localmachine_engine::LocalDatabase;

    #[test]
    fn status_of_fresh_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join("agent.journal");
        LocalDatabase::open(&journal).unwrap();

        let home = FacilityId::new();
        let status = open_store(&journal, home).unwrap().status();
        assert_eq!(status.home_facility, home);
        assert_eq!(status.total_events, 0);
        assert_eq!(time(status.last_synced_time), "never");
        assert!(run(&journal, home, OutputFormat::Json).is_ok());
    }
}
