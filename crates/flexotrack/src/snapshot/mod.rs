//! Point-in-time snapshots of the program ledger.

pub mod archive;
pub mod error;
pub mod service;
pub mod store;

pub use archive::{DateRange, SnapshotMetadata, SnapshotRecord};
pub use error::SnapshotError;
pub use service::{
    generate_snapshot_id, ActorDirectory, CreatedSnapshot, ExportFormat, RestoreOptions,
    RestoreReport, SnapshotFilter, SnapshotInfo, SnapshotService, SnapshotStats,
};
pub use store::{ArchiveInfo, ArchiveStore, DirectoryArchiveStore};
