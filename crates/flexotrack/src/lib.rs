pub mod audit;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod program;
pub mod scheduler;
pub mod snapshot;

pub use audit::{AuditEntry, AuditSink, LogAuditSink, MemoryAuditSink};
pub use broadcast::{ChangeNotifier, NotifyError, ProgramEvent, ProgramEventBroadcaster};
pub use config::{load_config, load_config_from_env, Config, MachineRange};
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, FlexoError, Result};
pub use program::{
    ActorId, MachineProgram, NewProgram, ProgramEngine, ProgramError, ProgramId, ProgramPatch,
    ProgramStatus, StatusChange,
};
pub use scheduler::{BackupSchedule, BackupScheduler};
pub use snapshot::{
    DirectoryArchiveStore, RestoreOptions, SnapshotError, SnapshotFilter, SnapshotService,
};
