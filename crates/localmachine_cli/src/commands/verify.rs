//! Verify command implementation.

use super::{load_entries, CliError, CliResult};
use localmachine_protocol::{ArchiveEntry, EventFile, ProtocolResult};
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of files checked.
    pub files_checked: usize,
    /// Number of events in valid files.
    pub events: usize,
    /// File name and failure of every damaged file.
    pub errors: Vec<(String, String)>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> CliResult<()> {
    println!("Verifying {}", path.display());
    let result = verify(path)?;

    for (name, error) in &result.errors {
        println!("  ERROR: {name}: {error}");
    }
    println!(
        "{} file(s) checked, {} event(s), {} error(s)",
        result.files_checked,
        result.events,
        result.errors.len()
    );

    if result.is_ok() {
        println!("✓ Verification passed");
        Ok(())
    } else {
        println!("✗ Verification failed");
        Err(CliError::VerificationFailed(result.errors.len()))
    }
}

/// Checks every packed file at `path`.
///
/// Archive entries must carry the packed-file suffix; a bare file is
/// checked by content only.
pub fn verify(path: &Path) -> CliResult<VerifyResult> {
    let in_archive = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
    let mut result = VerifyResult::default();

    for entry in load_entries(path)? {
        result.files_checked += 1;
        match check(&entry, in_archive) {
            Ok(events) => result.events += events,
            Err(e) => result.errors.push((entry.name, e.to_string())),
        }
    }
    Ok(result)
}

fn check(entry: &ArchiveEntry, check_name: bool) -> ProtocolResult<usize> {
    if check_name {
        EventFile::check_name(&entry.name)?;
    }
    Ok(EventFile::decode(&entry.data)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use localmachine_protocol::{pack_events, write_archive, Event, EventPayload, FacilityId};

    fn packed() -> Vec<u8> {
        let event = Event::new(
            "g",
            "ORDER",
            EventPayload::new(1, vec![1, 2, 3]),
            FacilityId::new(),
            FacilityId::new(),
        );
        pack_events([&event], usize::MAX).unwrap().remove(0).into_bytes()
    }

    #[test]
    fn reports_damaged_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut damaged = packed();
        let last = damaged.len() - 1;
        damaged[last] ^= 0xff;

        let archive = write_archive(&[
            ArchiveEntry::new("ok.dat", packed()),
            ArchiveEntry::new("bad.dat", damaged),
            ArchiveEntry::new("wrong.txt", packed()),
        ])
        .unwrap();
        let path = dir.path().join("export.zip");
        std::fs::write(&path, archive).unwrap();

        let result = verify(&path).unwrap();
        assert_eq!(result.files_checked, 3);
        assert_eq!(result.events, 1);
        let names: Vec<&str> = result.errors.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["bad.dat", "wrong.txt"]);
        assert!(run(&path).is_err());
    }

    #[test]
    fn bare_file_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.bin");
        std::fs::write(&path, packed()).unwrap();
        assert!(run(&path).is_ok());
    }
}
