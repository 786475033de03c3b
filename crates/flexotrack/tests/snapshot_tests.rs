//! Integration tests for snapshots against a live ledger.

mod common;

use std::io::{Cursor, Write};

use chrono::{Duration, TimeZone, Utc};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use common::{ProgramBuilder, TestHarness};
use flexotrack::snapshot::archive::{self, SnapshotMetadata, METADATA_ENTRY};
use flexotrack::snapshot::{ArchiveStore, RestoreOptions, SnapshotError, SnapshotFilter};
use flexotrack::{ProgramError, ProgramPatch, ProgramStatus};

fn seed(h: &TestHarness) {
    let base = Utc.with_ymd_and_hms(2026, 5, 4, 6, 0, 0).unwrap();
    let specs = [
        ("OT-1", 11, "Acme Foods", 300.0),
        ("OT-2", 11, "Acme Foods", 120.5),
        ("OT-3", 12, "Globex", 800.0),
        ("OT-4", 11, "Initech", 42.0),
        ("OT-5", 14, "Globex", 10.0),
    ];
    for (i, (wo, machine, client, weight)) in specs.into_iter().enumerate() {
        h.engine
            .create(
                ProgramBuilder::new(wo, machine)
                    .client(client)
                    .weight(weight)
                    .starting_at(base + Duration::hours(i as i64))
                    .build(),
                Some(2),
            )
            .unwrap();
    }
    let ids: Vec<_> = h.ledger().iter().map(|p| p.id).collect();
    h.advance(ids[0], &[ProgramStatus::Running]);
    h.advance(ids[2], &[ProgramStatus::Running, ProgramStatus::Completed]);
    h.advance(ids[3], &[ProgramStatus::Suspended]);
}

#[test]
fn test_restore_round_trip_after_bulk_clear() {
    let h = TestHarness::new();
    seed(&h);
    let before = h.ledger();

    let created = h
        .snapshots
        .create(&SnapshotFilter::default(), "before clear", Some(1))
        .unwrap();
    assert_eq!(created.record_count, 5);

    assert_eq!(h.engine.bulk_clear(Some(1)).unwrap(), 5);
    assert!(h.ledger().is_empty());

    let report = h
        .snapshots
        .restore(&created.id, RestoreOptions::default(), Some(1))
        .unwrap();
    assert_eq!(report.inserted, 5);
    assert_eq!(report.updated, 0);

    assert_eq!(h.ledger(), before);
}

#[test]
fn test_restore_failure_leaves_store_unchanged() {
    let h = TestHarness::new();
    seed(&h);
    let created = h
        .snapshots
        .create(&SnapshotFilter::default(), "s", None)
        .unwrap();

    let ledger = h.ledger();
    let first = ledger[0].id;
    let last = ledger[4].id;

    // Changes the restore would overwrite
    h.engine
        .update(
            first,
            ProgramPatch {
                substrate: Some("PET 12".to_string()),
                ..Default::default()
            },
            None,
        )
        .unwrap();
    h.engine
        .update(
            last,
            ProgramPatch {
                work_order: Some("OT-5-moved".to_string()),
                ..Default::default()
            },
            None,
        )
        .unwrap();
    // Takes the archived work order of the last record under a new id
    h.engine
        .create(ProgramBuilder::new("OT-5", 3).build(), None)
        .unwrap();
    let expected = h.ledger();

    let err = h
        .snapshots
        .restore(&created.id, RestoreOptions::default(), None)
        .unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::Program(ProgramError::DuplicateWorkOrder(ref wo)) if wo == "OT-5"
    ));

    assert_eq!(h.ledger(), expected);
    assert_eq!(h.engine.get(first).unwrap().substrate, "PET 12");
}

#[test]
fn test_verify_detects_removed_data_entry() {
    let h = TestHarness::new();
    seed(&h);
    let created = h
        .snapshots
        .create(&SnapshotFilter::default(), "s", None)
        .unwrap();
    assert!(h.snapshots.verify_integrity(&created.id).unwrap());

    // Rebuild the archive keeping only its metadata entry
    let original = h.store.read(&created.id).unwrap().unwrap();
    let mut archive = zip::ZipArchive::new(Cursor::new(original)).unwrap();
    let mut metadata = Vec::new();
    std::io::copy(&mut archive.by_name(METADATA_ENTRY).unwrap(), &mut metadata).unwrap();

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(METADATA_ENTRY, SimpleFileOptions::default())
        .unwrap();
    zip.write_all(&metadata).unwrap();
    let tampered = zip.finish().unwrap().into_inner();

    h.store.write_new("tampered_copy", &tampered).unwrap();
    assert!(!h.snapshots.verify_integrity("tampered_copy").unwrap());
    assert!(matches!(
        h.snapshots
            .restore("tampered_copy", RestoreOptions::default(), None),
        Err(SnapshotError::NotFound(_))
    ));
}

#[test]
fn test_machine_filtered_snapshot() {
    let h = TestHarness::new();
    seed(&h);
    let on_eleven = h.engine.list_by_machine(11).unwrap().len();

    let created = h
        .snapshots
        .create(&SnapshotFilter::machines([11]), "machine 11", None)
        .unwrap();
    assert_eq!(created.record_count, on_eleven);

    let listed = h.snapshots.list().unwrap();
    let info = listed.iter().find(|s| s.id == created.id).unwrap();
    assert_eq!(info.machine_count, Some(1));
    assert_eq!(info.record_count, Some(3));

    let stats = h.snapshots.stats(&created.id).unwrap();
    assert_eq!(stats.by_machine.keys().copied().collect::<Vec<_>>(), vec![11]);
    assert_eq!(stats.by_client.get("Acme Foods"), Some(&2));
    assert_eq!(stats.by_client.get("Initech"), Some(&1));
    assert!((stats.total_weight_kg - 462.5).abs() < 1e-9);
    let range = stats.date_range.unwrap();
    assert_eq!(range.to - range.from, Duration::hours(3));
}

#[test]
fn test_export_import_round_trip() {
    let h = TestHarness::new();
    seed(&h);
    let created = h
        .snapshots
        .create(&SnapshotFilter::default(), "s", None)
        .unwrap();

    let bytes = h.snapshots.export(&created.id, "zip").unwrap();
    let imported = h.snapshots.import(&bytes, "offsite.zip", Some(4)).unwrap();
    assert_eq!(
        h.snapshots.stats(&imported).unwrap().record_count,
        created.record_count
    );

    let err = h
        .snapshots
        .import(b"PK\x03\x04 truncated", "broken.zip", None)
        .unwrap_err();
    assert!(matches!(err, SnapshotError::InvalidArchive(_)));
    assert_eq!(h.snapshots.list().unwrap().len(), 2);
    assert!(h.audit.actions().contains(&"snapshot.import"));
}

#[test]
fn test_create_does_not_touch_ledger() {
    let h = TestHarness::new();
    seed(&h);
    let before = h.ledger();
    h.snapshots
        .create(&SnapshotFilter::default(), "s", None)
        .unwrap();
    assert_eq!(h.ledger(), before);
    assert!(h.backup_dir.read_dir().unwrap().next().is_some());
}

#[test]
fn test_restore_after_work_orders_swapped() {
    let h = TestHarness::new();
    let a = h
        .engine
        .create(ProgramBuilder::new("OT-A", 3).build(), None)
        .unwrap();
    let b = h
        .engine
        .create(ProgramBuilder::new("OT-B", 4).build(), None)
        .unwrap();
    let created = h
        .snapshots
        .create(&SnapshotFilter::default(), "s", None)
        .unwrap();
    let before = h.ledger();

    let rename = |id, code: &str| {
        h.engine
            .update(
                id,
                ProgramPatch {
                    work_order: Some(code.to_string()),
                    ..Default::default()
                },
                None,
            )
            .unwrap();
    };
    rename(a.id, "OT-TMP");
    rename(b.id, "OT-A");
    rename(a.id, "OT-B");

    let report = h
        .snapshots
        .restore(&created.id, RestoreOptions::default(), None)
        .unwrap();
    assert_eq!(report.updated, 2);

    let restored = h.ledger();
    assert_eq!(h.engine.get(a.id).unwrap().work_order, "OT-A");
    assert_eq!(h.engine.get(b.id).unwrap().work_order, "OT-B");
    for (now, then) in restored.iter().zip(&before) {
        assert_eq!(now.status, then.status);
        assert_eq!(now.machine_number, then.machine_number);
    }
}

#[test]
fn test_import_refuses_edited_records() {
    let h = TestHarness::new();
    seed(&h);
    let created = h
        .snapshots
        .create(&SnapshotFilter::default(), "s", None)
        .unwrap();
    let bytes = h.snapshots.export(&created.id, "zip").unwrap();

    // Completed without an end time, on a machine outside the fleet
    let mut records = archive::read_records(&bytes).unwrap();
    records[0].program.id = 77;
    records[0].program.status = ProgramStatus::Completed;
    records[0].program.end_time = None;
    records[0].program.machine_number = 999;
    let mut metadata = SnapshotMetadata::summarize("edited", "s", Utc::now(), &records);
    let edited = archive::package(&mut metadata, &records).unwrap();

    let err = h.snapshots.import(&edited, "edited.zip", None).unwrap_err();
    assert!(matches!(err, SnapshotError::InvalidArchive(_)));

    h.store.write_new("edited", &edited).unwrap();
    let before = h.ledger();
    assert!(matches!(
        h.snapshots.restore("edited", RestoreOptions::default(), None),
        Err(SnapshotError::InvalidArchive(_))
    ));
    assert_eq!(h.ledger(), before);
    assert!(h.engine.get(77).is_err());
}
