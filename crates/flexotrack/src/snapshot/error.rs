use std::path::PathBuf;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::program::ProgramError;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot '{0}' not found")]
    NotFound(String),

    #[error("Invalid snapshot archive: {0}")]
    InvalidArchive(String),

    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("Snapshot I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Restore rejected: {0}")]
    Program(#[from] ProgramError),
}
