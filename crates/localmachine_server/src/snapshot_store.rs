//! Content-addressed storage for master-data snapshot archives.

use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Stores snapshot archives by version name.
pub trait SnapshotStore: Send + Sync {
    /// Stores an archive. Storing an existing version replaces it.
    fn put(&self, version: &str, archive: &[u8]) -> ServerResult<()>;

    /// Loads an archive.
    fn get(&self, version: &str) -> ServerResult<Option<Vec<u8>>>;

    /// Deletes an archive. Deleting a missing version is not an error.
    fn remove(&self, version: &str) -> ServerResult<()>;

    /// Stored versions, sorted.
    fn versions(&self) -> ServerResult<Vec<String>>;
}

/// Snapshot store in memory.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    archives: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn put(&self, version: &str, archive: &[u8]) -> ServerResult<()> {
        self.archives
            .write()
            .insert(version.to_string(), archive.to_vec());
        Ok(())
    }

    fn get(&self, version: &str) -> ServerResult<Option<Vec<u8>>> {
        Ok(self.archives.read().get(version).cloned())
    }

    fn remove(&self, version: &str) -> ServerResult<()> {
        self.archives.write().remove(version);
        Ok(())
    }

    fn versions(&self) -> ServerResult<Vec<String>> {
        Ok(self.archives.read().keys().cloned().collect())
    }
}

/// Snapshot store keeping `<version>.zip` files in a directory.
pub struct DirectorySnapshotStore {
    dir: PathBuf,
}

impl DirectorySnapshotStore {
    /// Opens (and creates if needed) the directory.
    pub fn open(dir: impl AsRef<Path>) -> ServerResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_of(&self, version: &str) -> ServerResult<PathBuf> {
        let valid = !version.is_empty()
            && version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !version.starts_with('.');
        if !valid {
            return Err(ServerError::InvalidRequest(format!(
                "invalid snapshot version {version:?}"
            )));
        }
        Ok(self.dir.join(format!("{version}.zip")))
    }
}

impl SnapshotStore for DirectorySnapshotStore {
    fn put(&self, version: &str, archive: &[u8]) -> ServerResult<()> {
        let path = self.path_of(version)?;
        let tmp = path.with_extension("zip.tmp");
        fs::write(&tmp, archive)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, version: &str) -> ServerResult<Option<Vec<u8>>> {
        let path = self.path_of(version)?;
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, version: &str) -> ServerResult<()> {
        let path = self.path_of(version)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn versions(&self) -> ServerResult<Vec<String>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(version) = name.to_str().and_then(|n| n.strip_suffix(".zip")) {
                versions.push(version.to_string());
            }
        }
        versions.sort();
        Ok(versions)
    }
}
