//! Snapshot creation, listing, restore and maintenance.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audit::{AuditEntry, AuditSink};
use crate::config::MachineRange;
use crate::db::program_repo::{self, ProgramFilter};
use crate::db::{Database, DatabaseError};
use crate::program::model::{self, format_timestamp, query_programs};
use crate::program::{ActorId, MachineProgram, ProgramError, ProgramStatus};
use crate::snapshot::archive::{self, DateRange, SnapshotMetadata, SnapshotRecord};
use crate::snapshot::error::SnapshotError;
use crate::snapshot::store::{ArchiveInfo, ArchiveStore};

/// Resolves actor ids to human-readable names for archived records.
pub trait ActorDirectory: Send + Sync {
    fn display_name(&self, actor: ActorId) -> Option<String>;
}

impl ActorDirectory for HashMap<ActorId, String> {
    fn display_name(&self, actor: ActorId) -> Option<String> {
        self.get(&actor).cloned()
    }
}

/// Selects which programs go into a snapshot. Empty means everything.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    /// Inclusive lower bound on start time.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on start time.
    pub to: Option<DateTime<Utc>>,
    pub machines: Vec<u32>,
    pub statuses: Vec<ProgramStatus>,
}

impl SnapshotFilter {
    /// All machines and statuses, programs started within `window` of now.
    pub fn last_window(window: chrono::Duration) -> Self {
        Self {
            from: Some(Utc::now() - window),
            ..Default::default()
        }
    }

    pub fn machines(machines: impl IntoIterator<Item = u32>) -> Self {
        Self {
            machines: machines.into_iter().collect(),
            ..Default::default()
        }
    }

    fn to_program_filter(&self) -> ProgramFilter {
        ProgramFilter {
            machine_numbers: self.machines.iter().map(|&m| i64::from(m)).collect(),
            statuses: self.statuses.iter().map(|s| s.as_str().to_string()).collect(),
            from_start: self.from.map(format_timestamp),
            to_start: self.to.map(format_timestamp),
        }
    }
}

/// Result of creating a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSnapshot {
    pub id: String,
    pub record_count: usize,
    pub size_bytes: u64,
}

/// One entry of [`SnapshotService::list`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub id: String,
    pub description: String,
    pub created_at: Option<DateTime<Utc>>,
    pub record_count: Option<usize>,
    pub size_bytes: u64,
    pub machine_count: Option<usize>,
    pub date_range: Option<DateRange>,
    pub status_counts: BTreeMap<ProgramStatus, u64>,
    /// Archive has no readable metadata entry.
    pub legacy: bool,
}

impl SnapshotInfo {
    fn from_metadata(id: &str, metadata: SnapshotMetadata) -> Self {
        Self {
            id: id.to_string(),
            description: metadata.description,
            created_at: Some(metadata.created_at),
            record_count: Some(metadata.record_count),
            size_bytes: metadata.size_bytes,
            machine_count: Some(metadata.machines.len()),
            date_range: metadata.date_range,
            status_counts: metadata.status_counts,
            legacy: false,
        }
    }

    fn legacy(info: ArchiveInfo) -> Self {
        Self {
            id: info.id,
            description: "legacy/unverified".to_string(),
            created_at: info.modified,
            record_count: None,
            size_bytes: info.size_bytes,
            machine_count: None,
            date_range: None,
            status_counts: BTreeMap::new(),
            legacy: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Take a full snapshot of the current ledger before restoring.
    pub snapshot_before: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub restored: usize,
    pub inserted: usize,
    pub updated: usize,
    pub pre_restore_snapshot: Option<String>,
}

/// Aggregates recomputed from an archive's records.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    pub id: String,
    pub record_count: usize,
    pub by_status: BTreeMap<ProgramStatus, u64>,
    pub by_client: BTreeMap<String, u64>,
    pub by_machine: BTreeMap<u32, u64>,
    pub total_weight_kg: f64,
    pub date_range: Option<DateRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// The archive bytes as stored.
    Zip,
    /// The program records as one JSON array.
    Json,
}

impl FromStr for ExportFormat {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zip" => Ok(ExportFormat::Zip),
            "json" => Ok(ExportFormat::Json),
            other => Err(SnapshotError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Zip => f.write_str("zip"),
            ExportFormat::Json => f.write_str("json"),
        }
    }
}

/// Generates `backup_YYYYMMDD_HHMMSS_<8 hex>`.
pub fn generate_snapshot_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("backup_{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8])
}

pub struct SnapshotService {
    db: Database,
    store: Arc<dyn ArchiveStore>,
    audit: Arc<dyn AuditSink>,
    actors: Option<Arc<dyn ActorDirectory>>,
    machines: MachineRange,
}

impl SnapshotService {
    pub fn new(db: Database, store: Arc<dyn ArchiveStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            db,
            store,
            audit,
            actors: None,
            machines: MachineRange::default(),
        }
    }

    /// Machines archived records must belong to for verify and restore.
    pub fn with_machine_range(mut self, machines: MachineRange) -> Self {
        self.machines = machines;
        self
    }

    pub fn with_actor_directory(mut self, actors: Arc<dyn ActorDirectory>) -> Self {
        self.actors = Some(actors);
        self
    }

    /// Exports the programs matching `filter` to a new archive.
    pub fn create(
        &self,
        filter: &SnapshotFilter,
        description: &str,
        actor: Option<ActorId>,
    ) -> Result<CreatedSnapshot, SnapshotError> {
        let programs = query_programs(&self.db, &filter.to_program_filter())?;
        let records: Vec<SnapshotRecord> =
            programs.into_iter().map(|p| self.resolve_names(p)).collect();

        let now = Utc::now();
        let id = generate_snapshot_id(now);
        let mut metadata = SnapshotMetadata::summarize(&id, description, now, &records);
        let bytes = archive::package(&mut metadata, &records)?;
        self.store.write_new(&id, &bytes)?;

        log::info!(
            "Created snapshot {} with {} programs ({} bytes)",
            id,
            metadata.record_count,
            metadata.size_bytes
        );
        self.audit.record(AuditEntry::new(
            actor,
            "snapshot.create",
            id.clone(),
            format!(
                "records={} machines={:?}",
                metadata.record_count, metadata.machines
            ),
        ));

        Ok(CreatedSnapshot {
            id,
            record_count: metadata.record_count,
            size_bytes: metadata.size_bytes,
        })
    }

    /// Lists every stored archive, newest first.
    ///
    /// Archives without readable metadata are reported as legacy entries.
    pub fn list(&self) -> Result<Vec<SnapshotInfo>, SnapshotError> {
        let mut snapshots = Vec::new();
        for info in self.store.list()? {
            let bytes = match self.store.read(&info.id) {
                Ok(Some(bytes)) => bytes,
                // Deleted between listing and reading
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Snapshot {} could not be read: {}", info.id, e);
                    snapshots.push(SnapshotInfo::legacy(info));
                    continue;
                }
            };
            match archive::read_metadata(&bytes) {
                Ok(Some(metadata)) => {
                    snapshots.push(SnapshotInfo::from_metadata(&info.id, metadata));
                }
                Ok(None) | Err(_) => {
                    log::debug!("Snapshot {} has no readable metadata", info.id);
                    snapshots.push(SnapshotInfo::legacy(info));
                }
            }
        }

        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    /// Writes every archived program back into the store in one transaction.
    ///
    /// Existing ids are overwritten, missing ids are inserted with their
    /// archived id. Records that fail validation reject the whole archive.
    /// Any failure leaves the store untouched.
    pub fn restore(
        &self,
        id: &str,
        options: RestoreOptions,
        actor: Option<ActorId>,
    ) -> Result<RestoreReport, SnapshotError> {
        let bytes = self
            .store
            .read(id)?
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;
        let records = archive::read_records(&bytes).map_err(|e| {
            log::warn!("Snapshot {} has no usable data entry: {}", id, e);
            SnapshotError::NotFound(id.to_string())
        })?;
        archive::validate_records(&records, self.machines)?;

        let pre_restore_snapshot = if options.snapshot_before {
            let created = self.create(
                &SnapshotFilter::default(),
                &format!("Before restoring {}", id),
                actor,
            )?;
            Some(created.id)
        } else {
            None
        };

        let refreshed_at = format_timestamp(model::now());
        let ids: Vec<_> = records.iter().map(|r| r.program.id).collect();
        let (inserted, updated) = self.db.with_transaction(|tx| {
            // Codes may have moved between these ids since the snapshot
            program_repo::release_work_orders_in(tx, &ids)?;
            let mut inserted = 0;
            let mut updated = 0;
            for record in &records {
                let mut row = record.program.to_row();
                let written = match program_repo::find_by_id_in(tx, row.id)? {
                    Some(_) => {
                        row.updated_at = refreshed_at.clone();
                        updated += 1;
                        program_repo::update_in(tx, &row, None).map(|_| ())
                    }
                    None => {
                        inserted += 1;
                        program_repo::insert_with_id_in(tx, &row)
                    }
                };
                written.map_err(|e| restore_error(e, &row.work_order))?;
            }
            Ok::<_, SnapshotError>((inserted, updated))
        })?;

        log::info!(
            "Restored snapshot {}: {} inserted, {} updated",
            id,
            inserted,
            updated
        );
        self.audit.record(AuditEntry::new(
            actor,
            "snapshot.restore",
            id,
            format!("inserted={} updated={}", inserted, updated),
        ));

        Ok(RestoreReport {
            restored: inserted + updated,
            inserted,
            updated,
            pre_restore_snapshot,
        })
    }

    /// Whether the archive holds both entries in a parseable state.
    pub fn verify_integrity(&self, id: &str) -> Result<bool, SnapshotError> {
        let bytes = self
            .store
            .read(id)?
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;
        let ok = archive::verify(&bytes, self.machines);
        if !ok {
            log::warn!("Snapshot {} failed integrity check", id);
        }
        Ok(ok)
    }

    pub fn export(&self, id: &str, format: &str) -> Result<Vec<u8>, SnapshotError> {
        let format: ExportFormat = format.parse()?;
        let bytes = self
            .store
            .read(id)?
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;

        match format {
            ExportFormat::Zip => Ok(bytes),
            ExportFormat::Json => {
                let records = archive::read_records(&bytes)?;
                Ok(serde_json::to_vec_pretty(&records)?)
            }
        }
    }

    /// Stores uploaded archive bytes under a fresh id, keeping them only if
    /// they pass the integrity check.
    pub fn import(
        &self,
        bytes: &[u8],
        name: &str,
        actor: Option<ActorId>,
    ) -> Result<String, SnapshotError> {
        let id = generate_snapshot_id(Utc::now());
        self.store.write_new(&id, bytes)?;

        if !self.verify_integrity(&id)? {
            if let Err(e) = self.store.delete(&id) {
                log::error!("Failed to remove rejected import {}: {}", id, e);
            }
            return Err(SnapshotError::InvalidArchive(format!(
                "'{}' failed the integrity check",
                name
            )));
        }

        log::info!("Imported '{}' as snapshot {}", name, id);
        self.audit.record(AuditEntry::new(
            actor,
            "snapshot.import",
            id.clone(),
            format!("source={}", name),
        ));
        Ok(id)
    }

    /// Removes an archive. Returns `false` when there was nothing to delete.
    pub fn delete(&self, id: &str, actor: Option<ActorId>) -> Result<bool, SnapshotError> {
        let deleted = self.store.delete(id)?;
        if deleted {
            log::info!("Deleted snapshot {}", id);
            self.audit
                .record(AuditEntry::new(actor, "snapshot.delete", id, String::new()));
        } else {
            log::debug!("Snapshot {} already absent", id);
        }
        Ok(deleted)
    }

    /// Recomputes aggregates from the archived records.
    pub fn stats(&self, id: &str) -> Result<SnapshotStats, SnapshotError> {
        let bytes = self
            .store
            .read(id)?
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;
        let records = archive::read_records(&bytes)?;

        let mut stats = SnapshotStats {
            id: id.to_string(),
            record_count: records.len(),
            by_status: BTreeMap::new(),
            by_client: BTreeMap::new(),
            by_machine: BTreeMap::new(),
            total_weight_kg: 0.0,
            date_range: DateRange::of(records.iter().map(|r| &r.program)),
        };
        for SnapshotRecord { program, .. } in &records {
            *stats.by_status.entry(program.status).or_insert(0) += 1;
            *stats.by_client.entry(program.client_name.clone()).or_insert(0) += 1;
            *stats.by_machine.entry(program.machine_number).or_insert(0) += 1;
            stats.total_weight_kg += program.weight_kg;
        }
        Ok(stats)
    }

    /// Deletes archives created more than `max_age` ago. Returns their ids.
    ///
    /// A failed deletion is logged and the sweep moves on.
    pub fn prune_older_than(
        &self,
        max_age: chrono::Duration,
    ) -> Result<Vec<String>, SnapshotError> {
        let cutoff = Utc::now() - max_age;
        let mut pruned = Vec::new();

        for snapshot in self.list()? {
            let Some(created_at) = snapshot.created_at else {
                continue;
            };
            if created_at >= cutoff {
                continue;
            }
            match self.store.delete(&snapshot.id) {
                Ok(true) => pruned.push(snapshot.id),
                Ok(false) => {}
                Err(e) => log::error!("Failed to prune snapshot {}: {}", snapshot.id, e),
            }
        }

        if !pruned.is_empty() {
            log::info!("Pruned {} snapshots older than {}", pruned.len(), cutoff);
            self.audit.record(AuditEntry::new(
                None,
                "snapshot.prune",
                "*",
                pruned.join(","),
            ));
        }
        Ok(pruned)
    }

    fn resolve_names(&self, program: MachineProgram) -> SnapshotRecord {
        let mut record = SnapshotRecord::new(program);
        if let Some(actors) = &self.actors {
            let name = |actor: Option<ActorId>| actor.and_then(|a| actors.display_name(a));
            record.created_by_name = name(record.program.created_by);
            record.updated_by_name = name(record.program.updated_by);
            record.last_action_by_name = name(record.program.last_action_by);
        }
        record
    }
}

fn restore_error(err: DatabaseError, work_order: &str) -> SnapshotError {
    if err.is_unique_violation() {
        SnapshotError::Program(ProgramError::DuplicateWorkOrder(work_order.to_string()))
    } else {
        SnapshotError::Database(err)
    }
}
