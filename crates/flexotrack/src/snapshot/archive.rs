//! Snapshot archive layout: one zip holding a data entry and a metadata entry.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::{Cursor, Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::config::MachineRange;
use crate::program::{MachineProgram, ProgramStatus};
use crate::snapshot::error::SnapshotError;

/// Entry holding the archived program records.
pub const DATA_ENTRY: &str = "programs.json";
/// Entry holding the [`SnapshotMetadata`] document.
pub const METADATA_ENTRY: &str = "metadata.json";
/// Version of the archive layout written by this crate.
pub const FORMAT_VERSION: &str = "1.0";

/// A program as archived, with actor references resolved to display names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    #[serde(flatten)]
    pub program: MachineProgram,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action_by_name: Option<String>,
}

impl SnapshotRecord {
    pub fn new(program: MachineProgram) -> Self {
        Self {
            program,
            created_by_name: None,
            updated_by_name: None,
            last_action_by_name: None,
        }
    }
}

/// Earliest and latest start time among archived records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateRange {
    pub fn of<'a>(programs: impl IntoIterator<Item = &'a MachineProgram>) -> Option<Self> {
        programs.into_iter().fold(None, |range, p| {
            Some(match range {
                None => DateRange {
                    from: p.start_time,
                    to: p.start_time,
                },
                Some(r) => DateRange {
                    from: r.from.min(p.start_time),
                    to: r.to.max(p.start_time),
                },
            })
        })
    }
}

/// Summary document stored next to the data entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub record_count: usize,
    /// Uncompressed size of both entries in bytes.
    pub size_bytes: u64,
    pub format_version: String,
    pub app_version: String,
    pub machines: Vec<u32>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub status_counts: BTreeMap<ProgramStatus, u64>,
}

impl SnapshotMetadata {
    /// Summarises `records`. `size_bytes` is filled in by [`package`].
    pub fn summarize(
        id: &str,
        description: &str,
        created_at: DateTime<Utc>,
        records: &[SnapshotRecord],
    ) -> Self {
        let machines: BTreeSet<u32> = records.iter().map(|r| r.program.machine_number).collect();
        let mut status_counts = BTreeMap::new();
        for record in records {
            *status_counts.entry(record.program.status).or_insert(0) += 1;
        }

        Self {
            id: id.to_string(),
            created_at,
            description: description.to_string(),
            record_count: records.len(),
            size_bytes: 0,
            format_version: FORMAT_VERSION.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            machines: machines.into_iter().collect(),
            date_range: DateRange::of(records.iter().map(|r| &r.program)),
            status_counts,
        }
    }
}

/// Builds the archive bytes, settling `metadata.size_bytes` first.
///
/// The size covers the serialized metadata itself, so it is iterated until
/// the document length stops changing. The archive is then written once.
pub fn package(
    metadata: &mut SnapshotMetadata,
    records: &[SnapshotRecord],
) -> Result<Vec<u8>, SnapshotError> {
    let data = serde_json::to_vec_pretty(records)?;

    let mut meta = serde_json::to_vec_pretty(metadata)?;
    for _ in 0..8 {
        let total = (data.len() + meta.len()) as u64;
        if total == metadata.size_bytes {
            break;
        }
        metadata.size_bytes = total;
        meta = serde_json::to_vec_pretty(metadata)?;
    }

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(DATA_ENTRY, options)?;
    write_entry(&mut zip, &data)?;
    zip.start_file(METADATA_ENTRY, options)?;
    write_entry(&mut zip, &meta)?;

    Ok(zip.finish()?.into_inner())
}

fn write_entry(zip: &mut ZipWriter<Cursor<Vec<u8>>>, bytes: &[u8]) -> Result<(), SnapshotError> {
    zip.write_all(bytes)
        .map_err(|e| SnapshotError::Zip(ZipError::Io(e)))
}

/// Reads a named entry, `None` when the archive lacks it.
fn read_entry(bytes: &[u8], name: &str) -> Result<Option<Vec<u8>>, SnapshotError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut content = Vec::new();
    file.read_to_end(&mut content)
        .map_err(|e| SnapshotError::Zip(ZipError::Io(e)))?;
    Ok(Some(content))
}

/// Reads the metadata entry. Archives written without one yield `None`.
pub fn read_metadata(bytes: &[u8]) -> Result<Option<SnapshotMetadata>, SnapshotError> {
    read_entry(bytes, METADATA_ENTRY)?
        .map(|content| serde_json::from_slice(&content))
        .transpose()
        .map_err(SnapshotError::from)
}

/// Reads the archived records.
pub fn read_records(bytes: &[u8]) -> Result<Vec<SnapshotRecord>, SnapshotError> {
    let content = read_entry(bytes, DATA_ENTRY)?
        .ok_or_else(|| SnapshotError::InvalidArchive(format!("missing {}", DATA_ENTRY)))?;
    Ok(serde_json::from_slice(&content)?)
}

/// Rejects records the lifecycle engine could never have written.
pub fn validate_records(
    records: &[SnapshotRecord],
    machines: MachineRange,
) -> Result<(), SnapshotError> {
    let mut ids = HashSet::with_capacity(records.len());
    for SnapshotRecord { program, .. } in records {
        if !ids.insert(program.id) {
            return Err(SnapshotError::InvalidArchive(format!(
                "program id {} appears more than once",
                program.id
            )));
        }
        check_program(program, machines).map_err(|reason| {
            SnapshotError::InvalidArchive(format!(
                "program {} ({}): {}",
                program.id, program.work_order, reason
            ))
        })?;
    }
    Ok(())
}

fn check_program(program: &MachineProgram, machines: MachineRange) -> Result<(), String> {
    if program.id <= 0 {
        return Err("id must be positive".to_string());
    }
    if program.work_order.trim().is_empty() {
        return Err("empty work order".to_string());
    }
    if !machines.contains(program.machine_number) {
        return Err(format!(
            "machine {} outside {}..={}",
            program.machine_number, machines.first, machines.last
        ));
    }
    if program.colors.is_empty() {
        return Err("no colors".to_string());
    }
    if !(program.weight_kg.is_finite() && program.weight_kg > 0.0) {
        return Err(format!("weight {} is not positive", program.weight_kg));
    }
    if program.progress > 100 {
        return Err(format!("progress {} is outside 0..=100", program.progress));
    }
    let completed = program.status == ProgramStatus::Completed;
    if completed != program.end_time.is_some() {
        return Err(format!(
            "status {} does not match end time {:?}",
            program.status, program.end_time
        ));
    }
    Ok(())
}

/// Checks both entries are present and parseable, that the metadata record
/// count matches the data entry, and that every record is valid for
/// `machines`.
///
/// Any defect in the bytes is reported as `false`, never as an error.
pub fn verify(bytes: &[u8], machines: MachineRange) -> bool {
    let metadata = match read_metadata(bytes) {
        Ok(Some(metadata)) if !metadata.id.is_empty() => metadata,
        _ => return false,
    };
    match read_records(bytes) {
        Ok(records) => {
            records.len() == metadata.record_count
                && validate_records(&records, machines).is_ok()
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::model::tests_support::program;

    fn records() -> Vec<SnapshotRecord> {
        let mut late = program(2, "OT-2", 12);
        late.start_time += chrono::Duration::hours(5);
        late.status = ProgramStatus::Running;
        vec![
            SnapshotRecord::new(program(1, "OT-1", 11)),
            SnapshotRecord::new(late),
            SnapshotRecord::new(program(3, "OT-3", 11)),
        ]
    }

    fn verify_fleet(bytes: &[u8]) -> bool {
        verify(bytes, MachineRange::default())
    }

    fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_summarize() {
        let records = records();
        let meta = SnapshotMetadata::summarize("backup_x", "manual", Utc::now(), &records);

        assert_eq!(meta.record_count, 3);
        assert_eq!(meta.machines, vec![11, 12]);
        assert_eq!(meta.status_counts.get(&ProgramStatus::Ready), Some(&2));
        assert_eq!(meta.status_counts.get(&ProgramStatus::Running), Some(&1));
        let range = meta.date_range.unwrap();
        assert_eq!(range.to - range.from, chrono::Duration::hours(5));
        assert_eq!(meta.format_version, FORMAT_VERSION);
    }

    #[test]
    fn test_package_records_final_size() {
        let records = records();
        let mut meta = SnapshotMetadata::summarize("backup_x", "manual", Utc::now(), &records);
        let bytes = package(&mut meta, &records).unwrap();

        let stored = read_metadata(&bytes).unwrap().unwrap();
        assert_eq!(stored, meta);

        let data_len = serde_json::to_vec_pretty(&records).unwrap().len();
        let meta_len = serde_json::to_vec_pretty(&stored).unwrap().len();
        assert_eq!(stored.size_bytes, (data_len + meta_len) as u64);
    }

    #[test]
    fn test_records_survive_packaging() {
        let mut records = records();
        records[0].created_by_name = Some("Marta".to_string());
        let mut meta = SnapshotMetadata::summarize("backup_x", "manual", Utc::now(), &records);
        let bytes = package(&mut meta, &records).unwrap();
        assert_eq!(read_records(&bytes).unwrap(), records);
    }

    #[test]
    fn test_verify() {
        let records = records();
        let mut meta = SnapshotMetadata::summarize("backup_x", "manual", Utc::now(), &records);
        let bytes = package(&mut meta, &records).unwrap();
        assert!(verify_fleet(&bytes));

        let meta_json = serde_json::to_vec(&meta).unwrap();
        let data_json = serde_json::to_vec(&records).unwrap();

        assert!(!verify_fleet(&zip_with(&[(METADATA_ENTRY, &meta_json[..])])));
        assert!(!verify_fleet(&zip_with(&[(DATA_ENTRY, &data_json[..])])));
        assert!(!verify_fleet(&zip_with(&[
            (METADATA_ENTRY, &meta_json[..]),
            (DATA_ENTRY, &b"[]"[..])
        ])));
        assert!(!verify_fleet(&zip_with(&[
            (METADATA_ENTRY, &b"{ broken"[..]),
            (DATA_ENTRY, &data_json[..])
        ])));
        assert!(!verify_fleet(b"definitely not a zip"));
    }

    #[test]
    fn test_verify_accepts_empty_snapshot() {
        let mut meta = SnapshotMetadata::summarize("backup_empty", "manual", Utc::now(), &[]);
        let bytes = package(&mut meta, &[]).unwrap();
        assert!(verify_fleet(&bytes));
        assert!(meta.date_range.is_none());
    }

    #[test]
    fn test_missing_metadata_is_none() {
        let data_json = serde_json::to_vec(&records()).unwrap();
        let bytes = zip_with(&[(DATA_ENTRY, &data_json[..])]);
        assert!(read_metadata(&bytes).unwrap().is_none());
        assert_eq!(read_records(&bytes).unwrap().len(), 3);
    }

    #[test]
    fn test_validate_records_rejects_impossible_programs() {
        let machines = MachineRange::new(1, 24);
        assert!(validate_records(&records(), machines).is_ok());

        let mut completed_open = program(4, "OT-4", 11);
        completed_open.status = ProgramStatus::Completed;
        let mut finished_running = program(5, "OT-5", 11);
        finished_running.status = ProgramStatus::Running;
        finished_running.end_time = Some(finished_running.start_time);
        let mut no_colors = program(6, "OT-6", 11);
        no_colors.colors.clear();
        let mut weightless = program(7, "OT-7", 11);
        weightless.weight_kg = f64::NAN;
        let mut overrun = program(8, "OT-8", 11);
        overrun.progress = 101;

        for bad in [
            program(9, "OT-9", 999),
            program(10, "  ", 11),
            program(0, "OT-0", 11),
            completed_open,
            finished_running,
            no_colors,
            weightless,
            overrun,
        ] {
            let err = validate_records(&[SnapshotRecord::new(bad.clone())], machines).unwrap_err();
            assert!(
                matches!(err, SnapshotError::InvalidArchive(_)),
                "accepted {:?}",
                bad
            );
        }

        let twice = [
            SnapshotRecord::new(program(1, "OT-1", 11)),
            SnapshotRecord::new(program(1, "OT-2", 11)),
        ];
        assert!(validate_records(&twice, machines).is_err());
    }

    #[test]
    fn test_verify_rejects_invalid_record() {
        let mut forged = records();
        forged[0].program.status = ProgramStatus::Completed;
        forged[0].program.machine_number = 999;
        let mut meta = SnapshotMetadata::summarize("backup_x", "manual", Utc::now(), &forged);
        let bytes = package(&mut meta, &forged).unwrap();

        assert!(!verify_fleet(&bytes));
        // Still refused once the machine fits: completed without an end time
        assert!(!verify(&bytes, MachineRange::new(1, 999)));
    }
}
