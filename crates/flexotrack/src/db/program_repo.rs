//! Program repository — CRUD operations for the `machine_programs` table.
//!
//! Functions taking a `&Connection` can run inside a caller-owned
//! transaction; the `&Database` wrappers lock the shared connection.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw program row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramRow {
    pub id: i64,
    pub machine_number: i64,
    pub article_code: String,
    pub work_order: String,
    pub client_name: String,
    pub reference: String,
    pub short_code: String,
    pub substrate: String,
    pub weight_kg: f64,
    /// JSON array of color names.
    pub colors: String,
    pub color_count: i64,
    pub status: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub progress: i64,
    pub notes: Option<String>,
    pub last_action_by: Option<i64>,
    pub last_action_at: Option<String>,
    pub created_by: Option<i64>,
    pub updated_by: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
    pub version: i64,
}

impl ProgramRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            machine_number: row.get("machine_number")?,
            article_code: row.get("article_code")?,
            work_order: row.get("work_order")?,
            client_name: row.get("client_name")?,
            reference: row.get("reference")?,
            short_code: row.get("short_code")?,
            substrate: row.get("substrate")?,
            weight_kg: row.get("weight_kg")?,
            colors: row.get("colors")?,
            color_count: row.get("color_count")?,
            status: row.get("status")?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            progress: row.get("progress")?,
            notes: row.get("notes")?,
            last_action_by: row.get("last_action_by")?,
            last_action_at: row.get("last_action_at")?,
            created_by: row.get("created_by")?,
            updated_by: row.get("updated_by")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            version: row.get("version")?,
        })
    }
}

/// Query filter parameters for program listing.
///
/// Empty vectors mean "no restriction".
#[derive(Debug, Default, Clone)]
pub struct ProgramFilter {
    pub machine_numbers: Vec<i64>,
    pub statuses: Vec<String>,
    /// Inclusive lower bound on `start_time` (RFC 3339).
    pub from_start: Option<String>,
    /// Inclusive upper bound on `start_time` (RFC 3339).
    pub to_start: Option<String>,
}

const COLUMNS: &str = "machine_number, article_code, work_order, client_name, reference,
     short_code, substrate, weight_kg, colors, color_count, status, start_time, end_time,
     progress, notes, last_action_by, last_action_at, created_by, updated_by, created_at,
     updated_at, version";

/// Inserts a new program and returns the store-assigned id. `row.id` is ignored.
pub fn insert_in(conn: &Connection, row: &ProgramRow) -> Result<i64, DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO machine_programs ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
        ),
        params![
            row.machine_number,
            row.article_code,
            row.work_order,
            row.client_name,
            row.reference,
            row.short_code,
            row.substrate,
            row.weight_kg,
            row.colors,
            row.color_count,
            row.status,
            row.start_time,
            row.end_time,
            row.progress,
            row.notes,
            row.last_action_by,
            row.last_action_at,
            row.created_by,
            row.updated_by,
            row.created_at,
            row.updated_at,
            row.version,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Inserts a program keeping `row.id`, as used when restoring archived rows.
pub fn insert_with_id_in(conn: &Connection, row: &ProgramRow) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO machine_programs (id, {COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)"
        ),
        params![
            row.id,
            row.machine_number,
            row.article_code,
            row.work_order,
            row.client_name,
            row.reference,
            row.short_code,
            row.substrate,
            row.weight_kg,
            row.colors,
            row.color_count,
            row.status,
            row.start_time,
            row.end_time,
            row.progress,
            row.notes,
            row.last_action_by,
            row.last_action_at,
            row.created_by,
            row.updated_by,
            row.created_at,
            row.updated_at,
            row.version,
        ],
    )?;
    Ok(())
}

/// Overwrites every column except `id` and `created_at`, bumping `version`.
///
/// When `expected_version` is given the write only applies if the stored
/// version still matches. Returns the number of rows written (0 or 1).
pub fn update_in(
    conn: &Connection,
    row: &ProgramRow,
    expected_version: Option<i64>,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE machine_programs SET machine_number=?2, article_code=?3, work_order=?4,
         client_name=?5, reference=?6, short_code=?7, substrate=?8, weight_kg=?9, colors=?10,
         color_count=?11, status=?12, start_time=?13, end_time=?14, progress=?15, notes=?16,
         last_action_by=?17, last_action_at=?18, created_by=?19, updated_by=?20,
         updated_at=?21, version = version + 1
         WHERE id=?1 AND (?22 IS NULL OR version = ?22)",
        params![
            row.id,
            row.machine_number,
            row.article_code,
            row.work_order,
            row.client_name,
            row.reference,
            row.short_code,
            row.substrate,
            row.weight_kg,
            row.colors,
            row.color_count,
            row.status,
            row.start_time,
            row.end_time,
            row.progress,
            row.notes,
            row.last_action_by,
            row.last_action_at,
            row.created_by,
            row.updated_by,
            row.updated_at,
            expected_version,
        ],
    )?;
    Ok(changed)
}

/// Prefix of the placeholder codes written by [`release_work_orders_in`].
const RELEASED_WORK_ORDER: &str = "\u{1}restore:";

/// Swaps the work orders of `ids` for per-id placeholders.
///
/// Frees the codes so a batch rewrite in the same transaction can hand them
/// out in any order without tripping the UNIQUE index midway. Returns the
/// number of rows touched; `version` is left alone.
pub fn release_work_orders_in(conn: &Connection, ids: &[i64]) -> Result<usize, DatabaseError> {
    let mut stmt =
        conn.prepare("UPDATE machine_programs SET work_order = ?2 || id WHERE id = ?1")?;
    let mut released = 0;
    for id in ids {
        released += stmt.execute(params![id, RELEASED_WORK_ORDER])?;
    }
    Ok(released)
}

/// Finds a program by its id.
pub fn find_by_id_in(conn: &Connection, id: i64) -> Result<Option<ProgramRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM machine_programs WHERE id = ?1",
            params![id],
            ProgramRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Inserts a new program row, returning its id.
pub fn insert(db: &Database, row: &ProgramRow) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| insert_in(conn, row))
}

/// Updates a program row; see [`update_in`].
pub fn update(
    db: &Database,
    row: &ProgramRow,
    expected_version: Option<i64>,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| update_in(conn, row, expected_version))
}

/// Finds a program by its id.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<ProgramRow>, DatabaseError> {
    db.with_conn(|conn| find_by_id_in(conn, id))
}

/// Finds the program holding `work_order`, ignoring `exclude_id` if given.
pub fn find_by_work_order(
    db: &Database,
    work_order: &str,
    exclude_id: Option<i64>,
) -> Result<Option<ProgramRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM machine_programs
                 WHERE work_order = ?1 AND (?2 IS NULL OR id != ?2)",
                params![work_order, exclude_id],
                ProgramRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Queries programs matching `filter`, ordered by start time then id.
pub fn query(db: &Database, filter: &ProgramFilter) -> Result<Vec<ProgramRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if !filter.machine_numbers.is_empty() {
            let placeholders = push_all(&mut param_values, &filter.machine_numbers);
            conditions.push(format!("machine_number IN ({})", placeholders));
        }
        if !filter.statuses.is_empty() {
            let placeholders = push_all(&mut param_values, &filter.statuses);
            conditions.push(format!("status IN ({})", placeholders));
        }
        if let Some(ref from) = filter.from_start {
            conditions.push(format!("start_time >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(from.clone()));
        }
        if let Some(ref to) = filter.to_start {
            conditions.push(format!("start_time <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(to.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT * FROM machine_programs {} ORDER BY start_time ASC, id ASC",
            where_clause
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<ProgramRow> = stmt
            .query_map(params_ref.as_slice(), ProgramRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Appends `values` as positional parameters and returns their placeholders.
fn push_all<T>(param_values: &mut Vec<Box<dyn rusqlite::types::ToSql>>, values: &[T]) -> String
where
    T: rusqlite::types::ToSql + Clone + 'static,
{
    let mut placeholders = Vec::with_capacity(values.len());
    for value in values {
        param_values.push(Box::new(value.clone()));
        placeholders.push(format!("?{}", param_values.len()));
    }
    placeholders.join(", ")
}

/// Deletes a single program. Returns the number of deleted rows.
pub fn delete(db: &Database, id: i64) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute("DELETE FROM machine_programs WHERE id = ?1", params![id])?;
        Ok(deleted)
    })
}

/// Deletes every program on every machine.
pub fn delete_all(db: &Database) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute("DELETE FROM machine_programs", [])?;
        Ok(deleted)
    })
}

/// Counts programs grouped by stored status string.
pub fn count_by_status(db: &Database) -> Result<Vec<(String, u64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM machine_programs GROUP BY status ORDER BY status",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Distinct machine numbers holding at least one program in `statuses`.
/// An empty slice means any status.
pub fn distinct_machines(db: &Database, statuses: &[String]) -> Result<Vec<i64>, DatabaseError> {
    db.with_conn(|conn| {
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let where_clause = if statuses.is_empty() {
            String::new()
        } else {
            format!("WHERE status IN ({})", push_all(&mut param_values, statuses))
        };
        let sql = format!(
            "SELECT DISTINCT machine_number FROM machine_programs {} ORDER BY machine_number",
            where_clause
        );
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let machines = stmt
            .query_map(params_ref.as_slice(), |r| r.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(machines)
    })
}
