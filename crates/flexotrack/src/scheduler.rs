//! Daily automatic snapshots with retention pruning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::snapshot::{SnapshotFilter, SnapshotService};

const AUTOMATIC_DESCRIPTION: &str = "Automatic daily snapshot";

/// Timing of the backup loop.
#[derive(Debug, Clone, Copy)]
pub struct BackupSchedule {
    pub initial_delay: Duration,
    pub interval: Duration,
    /// Archives older than this are deleted after each backup.
    pub retention: chrono::Duration,
    /// Each backup covers programs started within this window.
    pub window: chrono::Duration,
}

impl From<&SchedulerConfig> for BackupSchedule {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            initial_delay: config.initial_delay(),
            interval: config.interval(),
            retention: config.retention(),
            window: config.window(),
        }
    }
}

/// What one scheduled run achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupTick {
    pub snapshot: Option<String>,
    pub pruned: usize,
}

/// Background loop taking a snapshot every interval.
///
/// Failures are logged and the loop waits for the next tick.
pub struct BackupScheduler {
    service: Arc<SnapshotService>,
    schedule: BackupSchedule,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl BackupScheduler {
    pub fn new(service: Arc<SnapshotService>, schedule: BackupSchedule) -> Self {
        Self {
            service,
            schedule,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns the loop on the current tokio runtime.
    ///
    /// The loop runs at most once per scheduler; later calls return `None`.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            log::warn!("Backup scheduler already started");
            return None;
        }

        let service = Arc::clone(&self.service);
        let schedule = self.schedule;
        let cancel = self.cancel.clone();

        Some(tokio::spawn(async move {
            log::info!(
                "Backup scheduler started (first run in {:?}, every {:?})",
                schedule.initial_delay,
                schedule.interval
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Backup scheduler stopped before first run");
                    return;
                }
                _ = tokio::time::sleep(schedule.initial_delay) => {}
            }

            let mut interval = tokio::time::interval(schedule.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        log::info!("Backup scheduler stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        let service = Arc::clone(&service);
                        let tick =
                            tokio::task::spawn_blocking(move || run_once(&service, &schedule));
                        if let Err(e) = tick.await {
                            log::error!("Backup run panicked: {}", e);
                        }
                    }
                }
            }
        }))
    }

    /// Signals the loop to stop. It exits at its next suspension point.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Runs one backup and retention sweep immediately.
    pub fn run_now(&self) -> BackupTick {
        run_once(&self.service, &self.schedule)
    }
}

fn run_once(service: &SnapshotService, schedule: &BackupSchedule) -> BackupTick {
    let mut tick = BackupTick::default();

    match service.create(
        &SnapshotFilter::last_window(schedule.window),
        AUTOMATIC_DESCRIPTION,
        None,
    ) {
        Ok(created) => {
            log::info!(
                "Automatic snapshot {} written ({} programs)",
                created.id,
                created.record_count
            );
            tick.snapshot = Some(created.id);
        }
        Err(e) => log::error!("Automatic snapshot failed: {}", e),
    }

    match service.prune_older_than(schedule.retention) {
        Ok(pruned) => tick.pruned = pruned.len(),
        Err(e) => log::error!("Snapshot retention sweep failed: {}", e),
    }

    tick
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::db::Database;
    use crate::snapshot::{ArchiveInfo, ArchiveStore, DirectoryArchiveStore, SnapshotError};
    use tempfile::TempDir;

    struct BrokenStore;

    impl ArchiveStore for BrokenStore {
        fn write_new(&self, _id: &str, _bytes: &[u8]) -> Result<(), SnapshotError> {
            Err(SnapshotError::InvalidArchive("disk full".to_string()))
        }
        fn read(&self, _id: &str) -> Result<Option<Vec<u8>>, SnapshotError> {
            Ok(None)
        }
        fn list(&self) -> Result<Vec<ArchiveInfo>, SnapshotError> {
            Err(SnapshotError::InvalidArchive("unreadable".to_string()))
        }
        fn delete(&self, _id: &str) -> Result<bool, SnapshotError> {
            Ok(false)
        }
    }

    fn schedule(initial_delay: Duration) -> BackupSchedule {
        BackupSchedule {
            initial_delay,
            interval: Duration::from_secs(3600),
            retention: chrono::Duration::days(30),
            window: chrono::Duration::hours(24),
        }
    }

    fn service(store: Arc<dyn ArchiveStore>) -> Arc<SnapshotService> {
        let db = Database::open_in_memory().unwrap();
        Arc::new(SnapshotService::new(
            db,
            store,
            Arc::new(MemoryAuditSink::new()),
        ))
    }

    #[test]
    fn test_schedule_from_config() {
        let schedule = BackupSchedule::from(&SchedulerConfig::default());
        assert_eq!(schedule.initial_delay, Duration::from_secs(60));
        assert_eq!(schedule.interval, Duration::from_secs(86_400));
        assert_eq!(schedule.retention, chrono::Duration::days(30));
        assert_eq!(schedule.window, chrono::Duration::hours(24));
    }

    #[test]
    fn test_run_now_survives_store_failures() {
        let scheduler = BackupScheduler::new(
            service(Arc::new(BrokenStore)),
            schedule(Duration::ZERO),
        );
        assert_eq!(scheduler.run_now(), BackupTick::default());
    }

    #[test]
    fn test_run_now_prunes_expired_archives() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DirectoryArchiveStore::new(dir.path()));
        let mut schedule = schedule(Duration::ZERO);
        schedule.retention = chrono::Duration::seconds(-60);
        let scheduler = BackupScheduler::new(service(store.clone()), schedule);

        let tick = scheduler.run_now();
        assert!(tick.snapshot.is_some());
        // The sweep runs after the backup, so even the new archive is expired
        assert_eq!(tick.pruned, 1);
        assert!(store.list().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loop_takes_snapshot_then_stops() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DirectoryArchiveStore::new(dir.path()));
        let scheduler =
            BackupScheduler::new(service(store.clone()), schedule(Duration::from_millis(10)));

        let handle = scheduler.start().unwrap();
        let mut waited = Duration::ZERO;
        while store.list().unwrap().is_empty() && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += Duration::from_millis(20);
        }
        scheduler.stop();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_during_initial_delay() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DirectoryArchiveStore::new(dir.path()));
        let scheduler =
            BackupScheduler::new(service(store.clone()), schedule(Duration::from_secs(3600)));

        let handle = scheduler.start().unwrap();
        scheduler.cancellation_token().cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_is_refused() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DirectoryArchiveStore::new(dir.path()));
        let scheduler =
            BackupScheduler::new(service(store.clone()), schedule(Duration::from_secs(3600)));

        let handle = scheduler.start().unwrap();
        assert!(scheduler.start().is_none());
        scheduler.stop();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
        // Stopping does not re-arm it
        assert!(scheduler.start().is_none());
    }
}
