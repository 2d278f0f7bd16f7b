mod common;

use assert_matches::assert_matches;
use chrono::Utc;
use serde_json::json;

use ngi_conductor::config::ExecutorKind;
use ngi_conductor::domain::UnitKey;
use ngi_conductor::engine::{Decision, ReconciliationEngine, SkipReason};
use ngi_conductor::error::ConductorError;
use ngi_conductor::status::RestartPolicy;
use ngi_conductor::tracking::{ProcessHandle, TrackingRecord};

use common::{RecordingNotifier, SEQRUN, charon_for, connector, project, temp_root, tracking_store};

fn record(root: &camino::Utf8Path) -> TrackingRecord {
    TrackingRecord {
        workflow: "echo".to_string(),
        engine: "echo_engine".to_string(),
        process: ProcessHandle {
            executor: ExecutorKind::Local,
            id: "4242".to_string(),
        },
        project_base_path: root.to_path_buf(),
        analysis_dir: root.join("ANALYSIS/P1/P1_101/echo"),
        results_dir: root.join("ANALYSIS/P1/P1_101/echo/results"),
        work_dir: root.join("ANALYSIS/P1/P1_101/echo/work"),
        exit_code_path: root.join("ANALYSIS/P1/P1_101/echo/P1-P1_101-echo.exit_code"),
        run_dir: None,
        recorded_at: Utc::now(),
    }
}

#[test]
fn fresh_sample_is_started() {
    let (_temp, root) = temp_root();
    let charon = connector(charon_for(&["P1_101"]));
    let tracking = tracking_store(&root);
    let notifier = RecordingNotifier::default();
    let engine = ReconciliationEngine::new(&charon, &tracking, &notifier);

    let decision = engine
        .evaluate_sample("P1", "P1_101", &RestartPolicy::default())
        .unwrap();
    assert_eq!(decision, Decision::Start);
    assert_eq!(notifier.count(), 0);
}

#[test]
fn finished_sample_needs_restart_flag() {
    let (_temp, root) = temp_root();
    let charon = connector(charon_for(&["P1_101"]).with(
        UnitKey::sample("P1", "P1_101"),
        json!({"analysis_status": "ANALYZED"}),
    ));
    let tracking = tracking_store(&root);
    let notifier = RecordingNotifier::default();
    let engine = ReconciliationEngine::new(&charon, &tracking, &notifier);

    let decision = engine
        .evaluate_sample("P1", "P1_101", &RestartPolicy::default())
        .unwrap();
    assert_eq!(decision, Decision::Skip(SkipReason::Finished));

    let restart = RestartPolicy {
        restart_finished: true,
        ..RestartPolicy::default()
    };
    assert!(engine.sample_should_be_started("P1", "P1_101", &restart).unwrap());
}

#[test]
fn failed_sample_is_skipped_without_restart_failed() {
    let (_temp, root) = temp_root();
    let charon = connector(charon_for(&["P1_101"]).with(
        UnitKey::sample("P1", "P1_101"),
        json!({"analysis_status": "FAILED"}),
    ));
    let tracking = tracking_store(&root);
    let notifier = RecordingNotifier::default();
    let engine = ReconciliationEngine::new(&charon, &tracking, &notifier);

    assert_eq!(
        engine
            .evaluate_sample("P1", "P1_101", &RestartPolicy::default())
            .unwrap(),
        Decision::Skip(SkipReason::Failed)
    );
    assert!(
        engine
            .sample_should_be_started("P1", "P1_101", &RestartPolicy::all())
            .unwrap()
    );
}

#[test]
fn running_remotely_without_local_record_is_incongruent() {
    let (_temp, root) = temp_root();
    let charon = connector(charon_for(&["P1_101"]).with(
        UnitKey::sample("P1", "P1_101"),
        json!({"analysis_status": "UNDER_ANALYSIS"}),
    ));
    let tracking = tracking_store(&root);
    let notifier = RecordingNotifier::default();
    let engine = ReconciliationEngine::new(&charon, &tracking, &notifier);

    let decision = engine
        .evaluate_sample("P1", "P1_101", &RestartPolicy::all())
        .unwrap();
    assert_eq!(decision, Decision::Skip(SkipReason::Incongruent));

    let notices = notifier.notices.lock().unwrap();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].project, "P1");
    assert_eq!(notices[0].sample.as_deref(), Some("P1_101"));
}

#[test]
fn locally_tracked_sample_counts_as_running() {
    let (_temp, root) = temp_root();
    let charon = connector(charon_for(&["P1_101"]));
    let tracking = tracking_store(&root);
    tracking
        .record(&UnitKey::sample("P1", "P1_101"), record(&root))
        .unwrap();
    let notifier = RecordingNotifier::default();
    let engine = ReconciliationEngine::new(&charon, &tracking, &notifier);

    assert_eq!(
        engine
            .evaluate_sample("P1", "P1_101", &RestartPolicy::default())
            .unwrap(),
        Decision::Skip(SkipReason::Running)
    );
    // The seqruns below a tracked sample are covered by its process.
    assert_eq!(
        engine
            .evaluate_seqrun("P1", "P1_101", "A", SEQRUN, &RestartPolicy::default())
            .unwrap(),
        Decision::Skip(SkipReason::Running)
    );

    let restart = RestartPolicy {
        restart_running: true,
        ..RestartPolicy::default()
    };
    assert!(engine.sample_should_be_started("P1", "P1_101", &restart).unwrap());
    assert_eq!(notifier.count(), 0);
}

#[test]
fn failed_libprep_qc_blocks_unless_forced() {
    let (_temp, root) = temp_root();
    let charon = connector(
        charon_for(&["P1_101"]).with(UnitKey::libprep("P1", "P1_101", "A"), json!({"qc": "FAILED"})),
    );
    let tracking = tracking_store(&root);
    let notifier = RecordingNotifier::default();
    let engine = ReconciliationEngine::new(&charon, &tracking, &notifier);

    assert_eq!(
        engine.evaluate_libprep("P1", "P1_101", "A", false).unwrap(),
        Decision::Skip(SkipReason::QcFailed)
    );
    assert!(engine.libprep_should_be_started("P1", "P1_101", "A", true).unwrap());
}

#[test]
fn selection_drops_finished_seqruns() {
    let (_temp, root) = temp_root();
    let mut project = project(&root, &["P1_101"]);
    let mut extra = ngi_conductor::domain::SequencingRun::new("190202_ST-E00201_0200_BHYYYYYY");
    extra.add_fastq_file("P1_101_S1_L002_R1_001.fastq.gz");
    project
        .add_sample(ngi_conductor::domain::Sample::new("P1_101"))
        .add_libprep(ngi_conductor::domain::LibraryPrep::new("A"))
        .add_seqrun(extra);

    let charon = connector(
        charon_for(&["P1_101"])
            .with(
                UnitKey::seqrun("P1", "P1_101", "A", SEQRUN),
                json!({"alignment_status": "DONE"}),
            )
            .with(
                UnitKey::seqrun("P1", "P1_101", "A", "190202_ST-E00201_0200_BHYYYYYY"),
                json!({"alignment_status": "NOT_RUNNING"}),
            ),
    );
    let tracking = tracking_store(&root);
    let notifier = RecordingNotifier::default();
    let engine = ReconciliationEngine::new(&charon, &tracking, &notifier);

    let sample = project.sample("P1_101").unwrap();
    let selected = engine
        .select_for_analysis(&project, sample, &RestartPolicy::default(), false)
        .unwrap()
        .unwrap();
    let seqruns: Vec<&str> = selected
        .seqrun_pairs()
        .map(|(_, seqrun)| seqrun.id.as_str())
        .collect();
    assert_eq!(seqruns, vec!["190202_ST-E00201_0200_BHYYYYYY"]);
}

#[test]
fn nothing_selected_when_every_seqrun_is_done() {
    let (_temp, root) = temp_root();
    let project = project(&root, &["P1_101"]);
    let charon = connector(charon_for(&["P1_101"]).with(
        UnitKey::seqrun("P1", "P1_101", "A", SEQRUN),
        json!({"alignment_status": "DONE"}),
    ));
    let tracking = tracking_store(&root);
    let notifier = RecordingNotifier::default();
    let engine = ReconciliationEngine::new(&charon, &tracking, &notifier);

    let sample = project.sample("P1_101").unwrap();
    let selected = engine
        .select_for_analysis(&project, sample, &RestartPolicy::default(), false)
        .unwrap();
    assert!(selected.is_none());
}

#[test]
fn unknown_sample_is_fresh() {
    let (_temp, root) = temp_root();
    let charon = connector(charon_for(&[]));
    let tracking = tracking_store(&root);
    let notifier = RecordingNotifier::default();
    let engine = ReconciliationEngine::new(&charon, &tracking, &notifier);

    assert!(
        engine
            .sample_should_be_started("P1", "P1_999", &RestartPolicy::default())
            .unwrap()
    );
}

#[test]
fn unreachable_charon_is_an_error_not_a_decision() {
    let (_temp, root) = temp_root();
    let mock = charon_for(&["P1_101"]);
    mock.set_unreachable();
    let charon = connector(mock);
    let tracking = tracking_store(&root);
    let notifier = RecordingNotifier::default();
    let engine = ReconciliationEngine::new(&charon, &tracking, &notifier);

    assert_matches!(
        engine.evaluate_sample("P1", "P1_101", &RestartPolicy::default()),
        Err(ConductorError::CharonHttp(_))
    );
}
