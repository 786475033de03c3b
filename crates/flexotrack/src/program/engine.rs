//! Program lifecycle engine: the single point of mutation for the ledger.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::audit::{AuditEntry, AuditSink};
use crate::broadcast::{ChangeNotifier, ProgramEvent};
use crate::config::MachineRange;
use crate::db::program_repo::{self, ProgramFilter};
use crate::db::{Database, DatabaseError};
use crate::program::error::ProgramError;
use crate::program::model::{
    self, query_programs, stored_precision, ActorId, MachineProgram, NewProgram, ProgramId,
    ProgramPatch, ProgramStats, StatusChange,
};
use crate::program::status::{EntryEffect, ProgramStatus, RUNNING_PROGRESS_FLOOR};

/// Validates and applies every change to machine programs, then announces it.
///
/// Writes go straight to the store; the engine holds no locks of its own.
/// Notification happens after the write has committed and never affects
/// the outcome of the call.
pub struct ProgramEngine {
    db: Database,
    notifier: Arc<dyn ChangeNotifier>,
    audit: Arc<dyn AuditSink>,
    machines: MachineRange,
}

impl ProgramEngine {
    pub fn new(
        db: Database,
        notifier: Arc<dyn ChangeNotifier>,
        audit: Arc<dyn AuditSink>,
        machines: MachineRange,
    ) -> Self {
        Self {
            db,
            notifier,
            audit,
            machines,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn machines(&self) -> MachineRange {
        self.machines
    }

    // ─── Mutations ──────────────────────────────────────────────────────────

    /// Creates a program in its initial state with zero progress.
    pub fn create(
        &self,
        request: NewProgram,
        actor: Option<ActorId>,
    ) -> Result<MachineProgram, ProgramError> {
        let work_order = request.work_order.trim().to_string();
        if work_order.is_empty() {
            return Err(ProgramError::Validation(
                "work order code must not be empty".to_string(),
            ));
        }
        self.check_machine(request.machine_number)?;
        check_colors(&request.colors)?;
        if request.colors.len() != request.color_count as usize {
            return Err(ProgramError::Validation(format!(
                "declared {} colors but {} were given",
                request.color_count,
                request.colors.len()
            )));
        }
        check_weight(request.weight_kg)?;

        if program_repo::find_by_work_order(&self.db, &work_order, None)?.is_some() {
            return Err(ProgramError::DuplicateWorkOrder(work_order));
        }

        let now = model::now();
        let mut program = MachineProgram {
            id: 0,
            machine_number: request.machine_number,
            article_code: request.article_code,
            work_order,
            client_name: request.client_name,
            reference: request.reference,
            short_code: request.short_code,
            substrate: request.substrate,
            weight_kg: request.weight_kg,
            colors: request.colors,
            color_count: request.color_count,
            status: request.initial_status.into(),
            start_time: request.start_time.map(stored_precision).unwrap_or(now),
            end_time: None,
            progress: 0,
            notes: request.notes,
            last_action_by: actor,
            last_action_at: Some(now),
            created_by: actor,
            updated_by: actor,
            created_at: now,
            updated_at: now,
            version: 1,
        };

        program.id = program_repo::insert(&self.db, &program.to_row())
            .map_err(|e| unique_to_duplicate(e, &program.work_order))?;

        log::info!(
            "Created program {} ({}) on machine {}",
            program.id,
            program.work_order,
            program.machine_number
        );
        self.audit.record(AuditEntry::new(
            actor,
            "program.create",
            program.id.to_string(),
            format!(
                "work_order={} machine={} status={}",
                program.work_order, program.machine_number, program.status
            ),
        ));
        self.notify(ProgramEvent::created(&program));

        Ok(program)
    }

    /// Applies a partial update of descriptive fields.
    pub fn update(
        &self,
        id: ProgramId,
        patch: ProgramPatch,
        actor: Option<ActorId>,
    ) -> Result<MachineProgram, ProgramError> {
        if patch.is_empty() {
            return Err(ProgramError::Validation("nothing to update".to_string()));
        }

        let mut program = self.get(id)?;
        check_expected_version(&program, patch.expected_version)?;

        if let Some(machine) = patch.machine_number {
            self.check_machine(machine)?;
            program.machine_number = machine;
        }
        if let Some(work_order) = patch.work_order {
            let work_order = work_order.trim().to_string();
            if work_order.is_empty() {
                return Err(ProgramError::Validation(
                    "work order code must not be empty".to_string(),
                ));
            }
            if work_order != program.work_order {
                if program_repo::find_by_work_order(&self.db, &work_order, Some(id))?.is_some() {
                    return Err(ProgramError::DuplicateWorkOrder(work_order));
                }
                program.work_order = work_order;
            }
        }
        if let Some(colors) = patch.colors {
            check_colors(&colors)?;
            program.colors = colors;
        }
        if let Some(weight) = patch.weight_kg {
            check_weight(weight)?;
            program.weight_kg = weight;
        }
        if let Some(v) = patch.article_code {
            program.article_code = v;
        }
        if let Some(v) = patch.client_name {
            program.client_name = v;
        }
        if let Some(v) = patch.reference {
            program.reference = v;
        }
        if let Some(v) = patch.short_code {
            program.short_code = v;
        }
        if let Some(v) = patch.substrate {
            program.substrate = v;
        }
        if let Some(v) = patch.start_time {
            program.start_time = stored_precision(v);
        }
        if let Some(v) = patch.notes {
            program.notes = Some(v);
        }

        program.touch(actor, model::now());
        self.persist(&mut program, patch.expected_version)?;

        log::debug!("Updated program {}", id);
        self.audit.record(AuditEntry::new(
            actor,
            "program.update",
            id.to_string(),
            format!("work_order={}", program.work_order),
        ));
        self.notify(ProgramEvent::updated(&program));

        Ok(program)
    }

    /// Moves a program to a new status, applying the entry side effect.
    pub fn change_status(
        &self,
        id: ProgramId,
        change: StatusChange,
        actor: Option<ActorId>,
    ) -> Result<MachineProgram, ProgramError> {
        let mut program = self.get(id)?;
        check_expected_version(&program, change.expected_version)?;

        let from = program.status;
        let to = change.status;
        if !from.can_transition_to(to) {
            return Err(ProgramError::InvalidTransition { from, to });
        }

        let now = model::now();
        program.status = to;
        match to.entry_effect() {
            EntryEffect::Finish => {
                program.end_time = Some(now);
                program.progress = 100;
            }
            EntryEffect::ProgressFloor => {
                if program.progress == 0 {
                    program.progress = RUNNING_PROGRESS_FLOOR;
                }
            }
            EntryEffect::RecordReason => match change.notes {
                Some(ref reason) => program.notes = Some(reason.clone()),
                None => log::warn!("Program {} suspended without a reason", id),
            },
            EntryEffect::None => {}
        }
        if !to.is_terminal() {
            program.end_time = None;
        }

        program.touch(actor, now);
        self.persist(&mut program, change.expected_version)?;

        log::info!(
            "Program {} on machine {}: {} -> {}",
            id,
            program.machine_number,
            from,
            to
        );
        self.audit.record(AuditEntry::new(
            actor,
            "program.status",
            id.to_string(),
            format!("{} -> {}", from, to),
        ));
        self.notify(ProgramEvent::status_changed(&program, change.notes.as_deref()));

        Ok(program)
    }

    /// Records measured progress for a running program.
    ///
    /// Progress never goes backwards; reaching 100 does not complete the job.
    pub fn report_progress(
        &self,
        id: ProgramId,
        percent: u8,
        actor: Option<ActorId>,
    ) -> Result<MachineProgram, ProgramError> {
        if percent > 100 {
            return Err(ProgramError::Validation(format!(
                "progress {} is outside 0..=100",
                percent
            )));
        }

        let mut program = self.get(id)?;
        if program.status != ProgramStatus::Running {
            return Err(ProgramError::Validation(format!(
                "progress can only be reported while running (status is {})",
                program.status
            )));
        }
        if percent < program.progress {
            return Err(ProgramError::Validation(format!(
                "progress cannot decrease from {} to {}",
                program.progress, percent
            )));
        }

        program.progress = percent;
        program.touch(actor, model::now());
        self.persist(&mut program, None)?;

        self.audit.record(AuditEntry::new(
            actor,
            "program.progress",
            id.to_string(),
            format!("progress={}", percent),
        ));
        self.notify(ProgramEvent::updated(&program));

        Ok(program)
    }

    /// Hard-deletes a single program.
    pub fn delete(
        &self,
        id: ProgramId,
        actor: Option<ActorId>,
    ) -> Result<MachineProgram, ProgramError> {
        let program = self.get(id)?;
        if program_repo::delete(&self.db, id)? == 0 {
            return Err(ProgramError::NotFound(id));
        }

        log::info!("Deleted program {} ({})", id, program.work_order);
        self.audit.record(AuditEntry::new(
            actor,
            "program.delete",
            id.to_string(),
            format!("work_order={}", program.work_order),
        ));

        Ok(program)
    }

    /// Deletes every program on every machine. Irreversible.
    ///
    /// Callers are expected to take a snapshot first.
    pub fn bulk_clear(&self, actor: Option<ActorId>) -> Result<usize, ProgramError> {
        let deleted = program_repo::delete_all(&self.db)?;

        log::warn!("Cleared all machine programs ({} deleted)", deleted);
        self.audit.record(AuditEntry::new(
            actor,
            "program.bulk_clear",
            "*",
            format!("deleted={}", deleted),
        ));

        Ok(deleted)
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    pub fn get(&self, id: ProgramId) -> Result<MachineProgram, ProgramError> {
        let row = program_repo::find_by_id(&self.db, id)?.ok_or(ProgramError::NotFound(id))?;
        Ok(MachineProgram::from_row(&row)?)
    }

    pub fn find_by_work_order(
        &self,
        work_order: &str,
    ) -> Result<Option<MachineProgram>, ProgramError> {
        program_repo::find_by_work_order(&self.db, work_order.trim(), None)?
            .map(|row| MachineProgram::from_row(&row))
            .transpose()
            .map_err(ProgramError::from)
    }

    pub fn list_all(&self) -> Result<Vec<MachineProgram>, ProgramError> {
        self.query(&ProgramFilter::default())
    }

    pub fn list_by_machine(&self, machine: u32) -> Result<Vec<MachineProgram>, ProgramError> {
        self.query(&ProgramFilter {
            machine_numbers: vec![i64::from(machine)],
            ..Default::default()
        })
    }

    pub fn list_by_status(
        &self,
        status: ProgramStatus,
    ) -> Result<Vec<MachineProgram>, ProgramError> {
        self.query(&ProgramFilter {
            statuses: vec![status.as_str().to_string()],
            ..Default::default()
        })
    }

    /// Programs that are ready, running or suspended.
    pub fn list_active(&self) -> Result<Vec<MachineProgram>, ProgramError> {
        self.query(&ProgramFilter {
            statuses: active_statuses(),
            ..Default::default()
        })
    }

    /// Machines currently holding at least one active program.
    pub fn active_machines(&self) -> Result<BTreeSet<u32>, ProgramError> {
        let machines = program_repo::distinct_machines(&self.db, &active_statuses())?;
        Ok(machines
            .into_iter()
            .filter_map(|m| u32::try_from(m).ok())
            .collect())
    }

    pub fn statistics(&self) -> Result<ProgramStats, ProgramError> {
        let mut stats = ProgramStats::default();
        for (status, count) in program_repo::count_by_status(&self.db)? {
            match status.parse::<ProgramStatus>() {
                Ok(status) => {
                    stats.by_status.insert(status, count);
                }
                Err(e) => log::warn!("Skipping {} programs with {}", count, e),
            }
            stats.total += count;
        }
        stats.active_machines =
            program_repo::distinct_machines(&self.db, &active_statuses())?.len() as u64;
        stats.machines_touched = program_repo::distinct_machines(&self.db, &[])?.len() as u64;
        Ok(stats)
    }

    fn query(&self, filter: &ProgramFilter) -> Result<Vec<MachineProgram>, ProgramError> {
        Ok(query_programs(&self.db, filter)?)
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    fn check_machine(&self, machine: u32) -> Result<(), ProgramError> {
        if self.machines.contains(machine) {
            Ok(())
        } else {
            Err(ProgramError::Validation(format!(
                "machine {} is outside {}..={}",
                machine, self.machines.first, self.machines.last
            )))
        }
    }

    /// Writes `program`, honouring `expected_version`, and bumps its version.
    fn persist(
        &self,
        program: &mut MachineProgram,
        expected_version: Option<i64>,
    ) -> Result<(), ProgramError> {
        let written = program_repo::update(&self.db, &program.to_row(), expected_version)
            .map_err(|e| unique_to_duplicate(e, &program.work_order))?;

        if written == 0 {
            // Either deleted underneath us or the version moved on.
            return match program_repo::find_by_id(&self.db, program.id)? {
                None => Err(ProgramError::NotFound(program.id)),
                Some(row) => Err(ProgramError::VersionConflict {
                    id: program.id,
                    expected: expected_version.unwrap_or(program.version),
                    actual: row.version,
                }),
            };
        }

        program.version += 1;
        Ok(())
    }

    fn notify(&self, event: ProgramEvent) {
        let kind = event.kind;
        let id = event.program_id;
        match self.notifier.publish(event) {
            Ok(0) => log::debug!("No subscribers for {:?} event on program {}", kind, id),
            Ok(_) => {}
            Err(e) => log::warn!("Dropped {:?} event for program {}: {}", kind, id, e),
        }
    }
}

fn active_statuses() -> Vec<String> {
    ProgramStatus::ALL
        .into_iter()
        .filter(|s| s.is_active())
        .map(|s| s.as_str().to_string())
        .collect()
}

fn check_colors(colors: &[String]) -> Result<(), ProgramError> {
    if colors.is_empty() {
        return Err(ProgramError::Validation(
            "at least one color is required".to_string(),
        ));
    }
    if colors.iter().any(|c| c.trim().is_empty()) {
        return Err(ProgramError::Validation(
            "color names must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn check_weight(weight_kg: f64) -> Result<(), ProgramError> {
    if weight_kg.is_finite() && weight_kg > 0.0 {
        Ok(())
    } else {
        Err(ProgramError::Validation(format!(
            "weight to produce must be positive, got {}",
            weight_kg
        )))
    }
}

fn check_expected_version(
    program: &MachineProgram,
    expected: Option<i64>,
) -> Result<(), ProgramError> {
    match expected {
        Some(expected) if expected != program.version => Err(ProgramError::VersionConflict {
            id: program.id,
            expected,
            actual: program.version,
        }),
        _ => Ok(()),
    }
}

fn unique_to_duplicate(err: DatabaseError, work_order: &str) -> ProgramError {
    if err.is_unique_violation() {
        ProgramError::DuplicateWorkOrder(work_order.to_string())
    } else {
        ProgramError::Database(err)
    }
}
