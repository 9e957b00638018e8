//! In-memory zip archives.
//!
//! Exports bundle packed event files (and, for master data, table dumps)
//! into one deflated zip that is carried by hand or downloaded.

use crate::error::{ProtocolError, ProtocolResult};
use std::io::{Cursor, Read, Write};
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

/// One named file inside an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// File name inside the archive.
    pub name: String,
    /// File content.
    pub data: Vec<u8>,
}

impl ArchiveEntry {
    /// Creates an entry.
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Writes `entries` into a deflated zip, in order.
pub fn write_archive(entries: &[ArchiveEntry]) -> ProtocolResult<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut zip = ZipWriter::new(&mut buf);
        let options: FileOptions<()> =
            FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for entry in entries {
            zip.start_file(entry.name.as_str(), options)
                .map_err(|e| ProtocolError::Archive(e.to_string()))?;
            zip.write_all(&entry.data)
                .map_err(|e| ProtocolError::Archive(e.to_string()))?;
        }

        zip.finish()
            .map_err(|e| ProtocolError::Archive(e.to_string()))?;
    }
    Ok(buf.into_inner())
}

/// Reads every file of a zip, in archive order. Directories are skipped.
pub fn read_archive(bytes: &[u8]) -> ProtocolResult<Vec<ArchiveEntry>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ProtocolError::Archive(format!("invalid zip: {e}")))?;

    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ProtocolError::Archive(e.to_string()))?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| ProtocolError::Archive(format!("{name}: {e}")))?;
        entries.push(ArchiveEntry { name, data });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_come_back_in_order() {
        let entries = vec![
            ArchiveEntry::new("B_A_20240101000000_1_of_2.dat", vec![1u8; 300]),
            ArchiveEntry::new("B_A_20240101000000_2_of_2.dat", b"tail".to_vec()),
        ];
        let bytes = write_archive(&entries).unwrap();
        assert_eq!(read_archive(&bytes).unwrap(), entries);
    }

    #[test]
    fn empty_archive() {
        let bytes = write_archive(&[]).unwrap();
        assert!(read_archive(&bytes).unwrap().is_empty());
    }

    #[test]
    fn not_a_zip() {
        assert!(matches!(
            read_archive(b"definitely not a zip"),
            Err(ProtocolError::Archive(_))
        ));
    }
}
