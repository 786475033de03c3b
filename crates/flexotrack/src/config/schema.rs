use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_backup_directory")]
    pub backup_directory: PathBuf,
    #[serde(default)]
    pub machines: MachineRange,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_database_path() -> PathBuf {
    crate::db::default_database_path().unwrap_or_else(|| PathBuf::from("flexotrack.db"))
}

fn default_backup_directory() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".flexotrack").join("backups"))
        .unwrap_or_else(|| PathBuf::from("backups"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            database_path: default_database_path(),
            backup_directory: default_backup_directory(),
            machines: MachineRange::default(),
            notifier: NotifierConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Inclusive range of physical machine numbers in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRange {
    pub first: u32,
    pub last: u32,
}

impl MachineRange {
    pub fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, machine: u32) -> bool {
        (self.first..=self.last).contains(&machine)
    }

    pub fn is_empty(&self) -> bool {
        self.first > self.last
    }
}

impl Default for MachineRange {
    fn default() -> Self {
        Self { first: 1, last: 24 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    256
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// Automatic snapshot scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Grace period before the first automatic snapshot.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Automatic snapshots older than this are pruned.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// How far back each automatic snapshot reaches.
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
}

fn default_true() -> bool {
    true
}

fn default_initial_delay_secs() -> u64 {
    60
}

fn default_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_retention_days() -> u32 {
    30
}

fn default_window_hours() -> u32 {
    24
}

impl SchedulerConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.window_hours))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_secs: default_initial_delay_secs(),
            interval_secs: default_interval_secs(),
            retention_days: default_retention_days(),
            window_hours: default_window_hours(),
        }
    }
}
