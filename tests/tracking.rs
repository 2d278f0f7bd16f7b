mod common;

use assert_matches::assert_matches;
use camino::Utf8Path;
use chrono::Utc;

use ngi_conductor::config::ExecutorKind;
use ngi_conductor::domain::UnitKey;
use ngi_conductor::error::ConductorError;
use ngi_conductor::tracking::{ProcessHandle, TrackingRecord, TrackingStore};

use common::{SEQRUN, temp_root, tracking_store};

fn record(root: &Utf8Path, id: &str) -> TrackingRecord {
    TrackingRecord {
        workflow: "echo".to_string(),
        engine: "echo_engine".to_string(),
        process: ProcessHandle {
            executor: ExecutorKind::Slurm,
            id: id.to_string(),
        },
        project_base_path: root.to_path_buf(),
        analysis_dir: root.join("ANALYSIS/P1/echo"),
        results_dir: root.join("ANALYSIS/P1/echo/results"),
        work_dir: root.join("ANALYSIS/P1/echo/work"),
        exit_code_path: root.join("ANALYSIS/P1/echo/P1-echo.exit_code"),
        run_dir: None,
        recorded_at: Utc::now(),
    }
}

#[test]
fn records_survive_reopening() {
    let (_temp, root) = temp_root();
    let key = UnitKey::sample("P1", "P1_101");
    let stored = record(&root, "777");
    assert!(tracking_store(&root).record(&key, stored.clone()).unwrap());

    let reopened = TrackingStore::new(root.join("tracking.json"));
    let records = reopened.all_records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records.get(&key), Some(&stored));
}

#[test]
fn at_most_one_record_per_unit() {
    let (_temp, root) = temp_root();
    let store = tracking_store(&root);
    let key = UnitKey::sample("P1", "P1_101");

    assert!(store.record(&key, record(&root, "1")).unwrap());
    assert!(!store.record(&key, record(&root, "2")).unwrap());

    let guard = store.open_for_read().unwrap();
    assert_eq!(guard.len(), 1);
    assert_eq!(guard.get(&key).unwrap().process.id, "1");
}

#[test]
fn removing_missing_record_leaves_store_untouched() {
    let (_temp, root) = temp_root();
    let store = tracking_store(&root);
    let kept = UnitKey::sample("P1", "P1_101");
    store.record(&kept, record(&root, "1")).unwrap();

    assert_matches!(
        store.remove(&UnitKey::sample("P1", "P1_999")),
        Err(ConductorError::TrackingRecordMissing(_))
    );
    assert!(store.open_for_read().unwrap().contains(&kept));
}

#[test]
fn keys_within_sample_cover_lower_levels() {
    let (_temp, root) = temp_root();
    let store = tracking_store(&root);
    let seqrun = UnitKey::seqrun("P1", "P1_101", "A", SEQRUN);
    store.record(&seqrun, record(&root, "1")).unwrap();
    store
        .record(&UnitKey::sample("P1", "P1_102"), record(&root, "2"))
        .unwrap();

    let guard = store.open_for_read().unwrap();
    assert_eq!(guard.keys_within_sample("P1", "P1_101"), vec![seqrun]);
    assert!(guard.keys_within_sample("P1", "P1_103").is_empty());
}

#[test]
fn missing_file_reads_as_empty() {
    let (_temp, root) = temp_root();
    let store = TrackingStore::new(root.join("nested/never_written.json"));
    assert!(store.all_records().unwrap().is_empty());
}
