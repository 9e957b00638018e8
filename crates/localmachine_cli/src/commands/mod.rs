//! CLI command implementations.

pub mod inspect;
pub mod status;
pub mod transfer;
pub mod verify;

use clap::ValueEnum;
use localmachine_engine::{EventStore, LocalDatabase, SyncError};
use localmachine_protocol::{read_archive, ArchiveEntry, FacilityId, ProtocolError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Output format of reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The journal does not exist.
    #[error("no agent journal at {0}")]
    JournalNotFound(PathBuf),

    /// Verification found damaged files.
    #[error("{0} file(s) failed verification")]
    VerificationFailed(usize),

    /// Malformed packed file or archive.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Engine failure.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON output failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Parses a facility id.
pub fn parse_facility(input: &str) -> Result<FacilityId, String> {
    Uuid::parse_str(input.trim())
        .map(FacilityId::from_uuid)
        .map_err(|e| format!("invalid facility id {input:?}: {e}"))
}

/// Parses `<id>=<code>`.
pub fn parse_facility_code(input: &str) -> Result<(FacilityId, String), String> {
    let (id, code) = input
        .split_once('=')
        .ok_or_else(|| format!("expected <id>=<code>, got {input:?}"))?;
    let code = code.trim();
    if code.is_empty() {
        return Err(format!("empty facility code in {input:?}"));
    }
    Ok((parse_facility(id)?, code.to_string()))
}

/// Opens the event store of an existing journal.
pub fn open_store(journal: &Path, home: FacilityId) -> CliResult<EventStore> {
    if !journal.exists() {
        return Err(CliError::JournalNotFound(journal.to_path_buf()));
    }
    let db = LocalDatabase::open(journal)?;
    Ok(EventStore::new(Arc::new(db), home))
}

/// Reads a `.zip` archive's entries, or a single packed file as one entry.
pub fn load_entries(path: &Path) -> CliResult<Vec<ArchiveEntry>> {
    let bytes = std::fs::read(path)?;
    let is_archive = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
    if is_archive {
        return Ok(read_archive(&bytes)?);
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(vec![ArchiveEntry::new(name, bytes)])
}
