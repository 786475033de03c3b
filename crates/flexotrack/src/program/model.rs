//! Machine program domain types and their mapping to stored rows.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::db::program_repo::{self, ProgramFilter, ProgramRow};
use crate::db::{Database, DatabaseError};
use crate::program::status::ProgramStatus;

/// Opaque actor reference supplied by the identity provider.
pub type ActorId = i64;

/// Identifier assigned by the program store.
pub type ProgramId = i64;

const TABLE: &str = "machine_programs";

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Formats timestamps with fixed precision so stored strings sort correctly.
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Drops precision the store does not keep, so returned values match reads.
pub(crate) fn stored_precision(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.trunc_subsecs(3)
}

/// Current time at stored precision.
pub(crate) fn now() -> DateTime<Utc> {
    stored_precision(Utc::now())
}

fn parse_timestamp(s: &str, id: ProgramId) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::InvalidRow {
            table: TABLE,
            id,
            reason: format!("bad timestamp '{}': {}", s, e),
        })
}

// ─── MachineProgram ─────────────────────────────────────────────────────────

/// One production job scheduled on one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineProgram {
    pub id: ProgramId,
    pub machine_number: u32,
    pub article_code: String,
    pub work_order: String,
    pub client_name: String,
    pub reference: String,
    pub short_code: String,
    pub substrate: String,
    pub weight_kg: f64,
    pub colors: Vec<String>,
    pub color_count: u32,
    pub status: ProgramStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub last_action_by: Option<ActorId>,
    #[serde(default)]
    pub last_action_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<ActorId>,
    #[serde(default)]
    pub updated_by: Option<ActorId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped on every write.
    #[serde(default = "initial_version")]
    pub version: i64,
}

fn initial_version() -> i64 {
    1
}

impl MachineProgram {
    /// Decodes a stored row.
    pub fn from_row(row: &ProgramRow) -> Result<Self, DatabaseError> {
        let invalid = |reason: String| DatabaseError::InvalidRow {
            table: TABLE,
            id: row.id,
            reason,
        };

        let status = row
            .status
            .parse::<ProgramStatus>()
            .map_err(|e| invalid(e.to_string()))?;
        let colors: Vec<String> =
            serde_json::from_str(&row.colors).map_err(|e| invalid(format!("bad colors: {}", e)))?;

        Ok(Self {
            id: row.id,
            machine_number: u32::try_from(row.machine_number)
                .map_err(|_| invalid(format!("bad machine number {}", row.machine_number)))?,
            article_code: row.article_code.clone(),
            work_order: row.work_order.clone(),
            client_name: row.client_name.clone(),
            reference: row.reference.clone(),
            short_code: row.short_code.clone(),
            substrate: row.substrate.clone(),
            weight_kg: row.weight_kg,
            colors,
            color_count: u32::try_from(row.color_count).unwrap_or(0),
            status,
            start_time: parse_timestamp(&row.start_time, row.id)?,
            end_time: row
                .end_time
                .as_deref()
                .map(|s| parse_timestamp(s, row.id))
                .transpose()?,
            progress: row.progress.clamp(0, 100) as u8,
            notes: row.notes.clone(),
            last_action_by: row.last_action_by,
            last_action_at: row
                .last_action_at
                .as_deref()
                .map(|s| parse_timestamp(s, row.id))
                .transpose()?,
            created_by: row.created_by,
            updated_by: row.updated_by,
            created_at: parse_timestamp(&row.created_at, row.id)?,
            updated_at: parse_timestamp(&row.updated_at, row.id)?,
            version: row.version,
        })
    }

    /// Encodes the program as a stored row.
    pub fn to_row(&self) -> ProgramRow {
        ProgramRow {
            id: self.id,
            machine_number: i64::from(self.machine_number),
            article_code: self.article_code.clone(),
            work_order: self.work_order.clone(),
            client_name: self.client_name.clone(),
            reference: self.reference.clone(),
            short_code: self.short_code.clone(),
            substrate: self.substrate.clone(),
            weight_kg: self.weight_kg,
            colors: serde_json::to_string(&self.colors).unwrap_or_else(|_| "[]".to_string()),
            color_count: i64::from(self.color_count),
            status: self.status.as_str().to_string(),
            start_time: format_timestamp(self.start_time),
            end_time: self.end_time.map(format_timestamp),
            progress: i64::from(self.progress),
            notes: self.notes.clone(),
            last_action_by: self.last_action_by,
            last_action_at: self.last_action_at.map(format_timestamp),
            created_by: self.created_by,
            updated_by: self.updated_by,
            created_at: format_timestamp(self.created_at),
            updated_at: format_timestamp(self.updated_at),
            version: self.version,
        }
    }

    /// Stamps audit fields for a mutation performed by `actor` at `now`.
    pub(crate) fn touch(&mut self, actor: Option<ActorId>, now: DateTime<Utc>) {
        self.updated_at = now;
        self.updated_by = actor;
        self.last_action_at = Some(now);
        self.last_action_by = actor;
    }
}

/// Loads programs matching `filter` and decodes them.
pub(crate) fn query_programs(
    db: &Database,
    filter: &ProgramFilter,
) -> Result<Vec<MachineProgram>, DatabaseError> {
    program_repo::query(db, filter)?
        .iter()
        .map(MachineProgram::from_row)
        .collect()
}

// ─── Requests ───────────────────────────────────────────────────────────────

/// State a freshly created program starts in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialStatus {
    Preparing,
    #[default]
    Ready,
}

impl From<InitialStatus> for ProgramStatus {
    fn from(initial: InitialStatus) -> Self {
        match initial {
            InitialStatus::Preparing => ProgramStatus::Preparing,
            InitialStatus::Ready => ProgramStatus::Ready,
        }
    }
}

/// Input for creating a program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProgram {
    pub machine_number: u32,
    pub work_order: String,
    #[serde(default)]
    pub article_code: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub short_code: String,
    #[serde(default)]
    pub substrate: String,
    pub weight_kg: f64,
    pub colors: Vec<String>,
    /// Declared number of colors; must equal `colors.len()`.
    pub color_count: u32,
    #[serde(default)]
    pub initial_status: InitialStatus,
    /// Scheduled start; defaults to the creation time.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Partial update of descriptive fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramPatch {
    pub machine_number: Option<u32>,
    pub work_order: Option<String>,
    pub article_code: Option<String>,
    pub client_name: Option<String>,
    pub reference: Option<String>,
    pub short_code: Option<String>,
    pub substrate: Option<String>,
    pub weight_kg: Option<f64>,
    pub colors: Option<Vec<String>>,
    pub start_time: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    /// Reject the update if the stored version differs.
    pub expected_version: Option<i64>,
}

impl ProgramPatch {
    pub fn is_empty(&self) -> bool {
        self.machine_number.is_none()
            && self.work_order.is_none()
            && self.article_code.is_none()
            && self.client_name.is_none()
            && self.reference.is_none()
            && self.short_code.is_none()
            && self.substrate.is_none()
            && self.weight_kg.is_none()
            && self.colors.is_none()
            && self.start_time.is_none()
            && self.notes.is_none()
    }
}

/// A requested status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub status: ProgramStatus,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

impl StatusChange {
    pub fn to(status: ProgramStatus) -> Self {
        Self {
            status,
            notes: None,
            expected_version: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn expecting_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

// ─── Statistics ─────────────────────────────────────────────────────────────

/// Aggregate counts over the whole ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramStats {
    pub total: u64,
    pub by_status: BTreeMap<ProgramStatus, u64>,
    /// Distinct machines holding at least one active program.
    pub active_machines: u64,
    /// Distinct machines holding any program.
    pub machines_touched: u64,
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use chrono::TimeZone;

    /// A ready program with fixed timestamps.
    pub(crate) fn program(id: ProgramId, work_order: &str, machine: u32) -> MachineProgram {
        let t = Utc.with_ymd_and_hms(2026, 1, 5, 7, 0, 0).unwrap();
        MachineProgram {
            id,
            machine_number: machine,
            article_code: "ART-1".to_string(),
            work_order: work_order.to_string(),
            client_name: "Acme Foods".to_string(),
            reference: "Snack wrap".to_string(),
            short_code: "SW".to_string(),
            substrate: "BOPP 20".to_string(),
            weight_kg: 100.0,
            colors: vec!["Cyan".to_string(), "Black".to_string()],
            color_count: 2,
            status: ProgramStatus::Ready,
            start_time: t,
            end_time: None,
            progress: 0,
            notes: None,
            last_action_by: None,
            last_action_at: None,
            created_by: None,
            updated_by: None,
            created_at: t,
            updated_at: t,
            version: 1,
        }
    }
}
