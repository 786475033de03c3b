//! Test harness for isolated test execution.
//!
//! Every harness owns a temporary directory holding the SQLite file and the
//! snapshot archives, so tests never share state.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use flexotrack::audit::MemoryAuditSink;
use flexotrack::broadcast::ProgramEventBroadcaster;
use flexotrack::snapshot::{DirectoryArchiveStore, SnapshotService};
use flexotrack::{
    Database, MachineProgram, MachineRange, ProgramEngine, ProgramStatus, StatusChange,
};

pub struct TestHarness {
    temp_dir: TempDir,
    pub backup_dir: PathBuf,
    pub db: Database,
    pub broadcaster: ProgramEventBroadcaster,
    pub audit: Arc<MemoryAuditSink>,
    pub store: Arc<DirectoryArchiveStore>,
    pub engine: ProgramEngine,
    pub snapshots: SnapshotService,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let backup_dir = temp_dir.path().join("backups");
        let db = Database::open(&temp_dir.path().join("ledger.db"))
            .expect("Failed to open database");

        let broadcaster = ProgramEventBroadcaster::new(64);
        let audit = Arc::new(MemoryAuditSink::new());
        let store = Arc::new(DirectoryArchiveStore::new(&backup_dir));

        let engine = ProgramEngine::new(
            db.clone(),
            Arc::new(broadcaster.clone()),
            audit.clone(),
            MachineRange::new(1, 24),
        );
        let snapshots = SnapshotService::new(db.clone(), store.clone(), audit.clone())
            .with_machine_range(engine.machines());

        Self {
            temp_dir,
            backup_dir,
            db,
            broadcaster,
            audit,
            store,
            engine,
            snapshots,
        }
    }

    /// Moves a program through the given statuses in order.
    pub fn advance(&self, id: i64, path: &[ProgramStatus]) -> MachineProgram {
        let mut program = self.engine.get(id).expect("program exists");
        for status in path {
            program = self
                .engine
                .change_status(id, StatusChange::to(*status), Some(1))
                .expect("transition allowed");
        }
        program
    }

    /// Programs sorted by id.
    pub fn ledger(&self) -> Vec<MachineProgram> {
        let mut programs = self.engine.list_all().expect("list programs");
        programs.sort_by_key(|p| p.id);
        programs
    }
}
