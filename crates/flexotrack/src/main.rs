use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use flexotrack::config::{load_config, load_config_from_env, Config};
use flexotrack::logging::{init_logging, LogFormat};
use flexotrack::{
    BackupSchedule, BackupScheduler, Database, DirectoryArchiveStore, LogAuditSink, MachineRange,
    ProgramEngine, ProgramEventBroadcaster, ProgramStatus, RestoreOptions, SnapshotError,
    SnapshotFilter, SnapshotService,
};

#[derive(Parser, Debug)]
#[command(name = "flexotrack", version, about = "Press program ledger and snapshots")]
struct Args {
    /// Config file; defaults to $FLEXOTRACK_CONFIG or built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Actor id stamped on audited actions.
    #[arg(long, global = true)]
    actor: Option<i64>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the automatic backup scheduler until interrupted.
    Serve,
    Snapshot {
        #[command(subcommand)]
        snapshot: SnapshotCmd,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotCmd {
    Create {
        #[arg(long = "machine")]
        machines: Vec<u32>,
        #[arg(long = "status")]
        statuses: Vec<ProgramStatus>,
        /// Earliest start time (RFC 3339).
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Latest start time (RFC 3339).
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        #[arg(long, default_value = "Manual snapshot")]
        description: String,
    },
    List,
    Restore {
        id: String,
        /// Snapshot the current ledger first.
        #[arg(long)]
        snapshot_before: bool,
    },
    Verify {
        id: String,
    },
    Export {
        id: String,
        #[arg(long, default_value = "zip")]
        format: String,
        #[arg(long)]
        output: PathBuf,
    },
    Import {
        path: PathBuf,
    },
    Delete {
        id: String,
    },
    Stats {
        id: String,
    },
}

fn main() -> ExitCode {
    init_logging(LogFormat::from_env());
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> flexotrack::Result<()> {
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => load_config_from_env()?,
    };
    let db = Database::open(&config.database_path)?;
    let snapshots = Arc::new(
        SnapshotService::new(
            db.clone(),
            Arc::new(DirectoryArchiveStore::new(&config.backup_directory)),
            Arc::new(LogAuditSink),
        )
        .with_machine_range(config.machines),
    );

    match args.cmd {
        Cmd::Serve => serve(&config, db, snapshots),
        Cmd::Snapshot { snapshot } => run_snapshot(&snapshots, snapshot, args.actor),
    }
}

fn serve(config: &Config, db: Database, snapshots: Arc<SnapshotService>) -> flexotrack::Result<()> {
    let engine = ProgramEngine::new(
        db,
        Arc::new(ProgramEventBroadcaster::new(config.notifier.capacity)),
        Arc::new(LogAuditSink),
        config.machines,
    );
    report_ledger(&engine, config.machines)?;

    if !config.scheduler.enabled {
        tracing::info!("Automatic snapshots disabled; nothing to do");
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| SnapshotError::Io {
            path: config.backup_directory.clone(),
            source: e,
        })?;

    runtime.block_on(async {
        let scheduler = BackupScheduler::new(snapshots, BackupSchedule::from(&config.scheduler));
        let token = scheduler.cancellation_token();
        if let Err(e) = ctrlc::set_handler(move || token.cancel()) {
            tracing::warn!("Could not install Ctrl-C handler: {}", e);
        }

        if let Some(handle) = scheduler.start() {
            if let Err(e) = handle.await {
                tracing::error!("Backup scheduler task failed: {}", e);
            }
        }
        tracing::info!("Shut down");
    });

    Ok(())
}

fn report_ledger(engine: &ProgramEngine, machines: MachineRange) -> flexotrack::Result<()> {
    let stats = engine.statistics()?;
    tracing::info!(
        total = stats.total,
        active_machines = stats.active_machines,
        "Ledger open for machines {}..={}",
        machines.first,
        machines.last
    );
    Ok(())
}

fn run_snapshot(
    service: &SnapshotService,
    cmd: SnapshotCmd,
    actor: Option<i64>,
) -> flexotrack::Result<()> {
    match cmd {
        SnapshotCmd::Create {
            machines,
            statuses,
            from,
            to,
            description,
        } => {
            let filter = SnapshotFilter {
                from,
                to,
                machines,
                statuses,
            };
            print_json(&service.create(&filter, &description, actor)?)
        }
        SnapshotCmd::List => print_json(&service.list()?),
        SnapshotCmd::Restore {
            id,
            snapshot_before,
        } => print_json(&service.restore(&id, RestoreOptions { snapshot_before }, actor)?),
        SnapshotCmd::Verify { id } => {
            let ok = service.verify_integrity(&id)?;
            println!("{}", if ok { "ok" } else { "corrupt" });
            if ok {
                Ok(())
            } else {
                Err(SnapshotError::InvalidArchive(id).into())
            }
        }
        SnapshotCmd::Export { id, format, output } => {
            let bytes = service.export(&id, &format)?;
            write_file(&output, &bytes)?;
            tracing::info!("Exported {} as {} to {}", id, format, output.display());
            Ok(())
        }
        SnapshotCmd::Import { path } => {
            let bytes = std::fs::read(&path).map_err(|e| SnapshotError::Io {
                path: path.clone(),
                source: e,
            })?;
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload.zip");
            println!("{}", service.import(&bytes, name, actor)?);
            Ok(())
        }
        SnapshotCmd::Delete { id } => {
            if !service.delete(&id, actor)? {
                tracing::warn!("Snapshot {} not found", id);
            }
            Ok(())
        }
        SnapshotCmd::Stats { id } => print_json(&service.stats(&id)?),
    }
}

fn print_json<T: Serialize>(value: &T) -> flexotrack::Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(SnapshotError::from)?;
    println!("{}", json);
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> flexotrack::Result<()> {
    std::fs::write(path, bytes).map_err(|e| {
        SnapshotError::Io {
            path: path.to_path_buf(),
            source: e,
        }
        .into()
    })
}
