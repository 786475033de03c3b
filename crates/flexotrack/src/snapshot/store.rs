use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::snapshot::error::SnapshotError;

const ARCHIVE_EXTENSION: &str = "zip";

/// A stored archive as seen by a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub id: String,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Flat namespace of write-once archive files addressed by snapshot id.
pub trait ArchiveStore: Send + Sync {
    /// Writes a new archive. Fails if `id` is already taken.
    fn write_new(&self, id: &str, bytes: &[u8]) -> Result<(), SnapshotError>;

    /// Reads an archive, `None` when it does not exist.
    fn read(&self, id: &str) -> Result<Option<Vec<u8>>, SnapshotError>;

    fn list(&self) -> Result<Vec<ArchiveInfo>, SnapshotError>;

    /// Removes an archive; returns whether it existed.
    fn delete(&self, id: &str) -> Result<bool, SnapshotError>;
}

/// Stores archives as `<id>.zip` files in one directory.
pub struct DirectoryArchiveStore {
    root: PathBuf,
}

impl DirectoryArchiveStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_root(&self) -> Result<(), SnapshotError> {
        std::fs::create_dir_all(&self.root).map_err(|e| SnapshotError::Io {
            path: self.root.clone(),
            source: e,
        })
    }

    /// Maps an id to its file, refusing anything that could escape the root.
    fn path_for(&self, id: &str) -> Option<PathBuf> {
        if !is_valid_id(id) {
            return None;
        }
        Some(self.root.join(format!("{}.{}", id, ARCHIVE_EXTENSION)))
    }
}

pub(crate) fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ArchiveStore for DirectoryArchiveStore {
    fn write_new(&self, id: &str, bytes: &[u8]) -> Result<(), SnapshotError> {
        let path = self
            .path_for(id)
            .ok_or_else(|| SnapshotError::InvalidArchive(format!("invalid snapshot id '{}'", id)))?;
        self.ensure_root()?;

        // create_new makes the existence check and creation one step
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| SnapshotError::Io {
                path: path.clone(),
                source: e,
            })?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| SnapshotError::Io { path, source: e })
    }

    fn read(&self, id: &str) -> Result<Option<Vec<u8>>, SnapshotError> {
        let Some(path) = self.path_for(id) else {
            return Ok(None);
        };
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SnapshotError::Io { path, source: e }),
        }
    }

    fn list(&self) -> Result<Vec<ArchiveInfo>, SnapshotError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SnapshotError::Io {
                    path: self.root.clone(),
                    source: e,
                })
            }
        };

        let mut archives = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_id(id) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                log::warn!("Skipping unreadable archive {}", path.display());
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            archives.push(ArchiveInfo {
                id: id.to_string(),
                size_bytes: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        archives.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(archives)
    }

    fn delete(&self, id: &str) -> Result<bool, SnapshotError> {
        let Some(path) = self.path_for(id) else {
            return Ok(false);
        };
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SnapshotError::Io { path, source: e }),
        }
    }
}
