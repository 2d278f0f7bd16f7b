#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};

use ngi_conductor::charon::{CharonClient, CharonRecord, Fields, StatusConnector, id_field};
use ngi_conductor::config::ExecutorKind;
use ngi_conductor::domain::{LibraryPrep, Project, Sample, SequencingRun, UnitKey};
use ngi_conductor::error::ConductorError;
use ngi_conductor::metrics::AnalysisMetrics;
use ngi_conductor::notify::{Notice, Notifier};
use ngi_conductor::process::{LaunchRequest, ProcessConnector};
use ngi_conductor::tracking::TrackingStore;
use ngi_conductor::workflow::{AnalysisTarget, ProcessingStep, WorkflowAdapter, WorkflowRegistry};

pub const SEQRUN: &str = "190101_ST-E00201_0123_AHXXXXXX";

/// In-memory Charon.
#[derive(Default)]
pub struct MockCharon {
    pub records: Mutex<BTreeMap<UnitKey, Fields>>,
    pub failing_updates: Mutex<Vec<UnitKey>>,
    pub failing_gets: Mutex<Vec<UnitKey>>,
    pub unreachable: Mutex<bool>,
    pub creates: Mutex<usize>,
    pub resets: Mutex<Vec<UnitKey>>,
}

impl MockCharon {
    pub fn with(self, unit: UnitKey, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Fields::new(),
        };
        self.records.lock().unwrap().insert(unit, fields);
        self
    }

    pub fn field(&self, unit: &UnitKey, name: &str) -> Option<Value> {
        self.records
            .lock()
            .unwrap()
            .get(unit)
            .and_then(|fields| fields.get(name).cloned())
    }

    pub fn fail_updates_for(&self, unit: UnitKey) {
        self.failing_updates.lock().unwrap().push(unit);
    }

    pub fn fail_gets_for(&self, unit: UnitKey) {
        self.failing_gets.lock().unwrap().push(unit);
    }

    pub fn set_unreachable(&self) {
        *self.unreachable.lock().unwrap() = true;
    }

    fn check_reachable(&self) -> Result<(), ConductorError> {
        if *self.unreachable.lock().unwrap() {
            return Err(ConductorError::CharonHttp("connection refused".to_string()));
        }
        Ok(())
    }

    fn with_id(unit: &UnitKey, fields: &Fields) -> CharonRecord {
        let mut fields = fields.clone();
        if let Some(id) = unit.ids().last() {
            fields.insert(id_field(unit.level()).to_string(), json!(id));
        }
        CharonRecord(fields)
    }
}

impl CharonClient for MockCharon {
    fn get(&self, unit: &UnitKey) -> Result<CharonRecord, ConductorError> {
        self.check_reachable()?;
        if self.failing_gets.lock().unwrap().contains(unit) {
            return Err(ConductorError::CharonStatus {
                status: 500,
                message: "internal error".to_string(),
            });
        }
        self.records
            .lock()
            .unwrap()
            .get(unit)
            .map(|fields| Self::with_id(unit, fields))
            .ok_or_else(|| ConductorError::CharonNotFound(unit.to_string()))
    }

    fn create(&self, unit: &UnitKey, fields: Fields) -> Result<CharonRecord, ConductorError> {
        self.check_reachable()?;
        let mut records = self.records.lock().unwrap();
        if records.contains_key(unit) {
            return Err(ConductorError::CharonConflict(unit.to_string()));
        }
        *self.creates.lock().unwrap() += 1;
        let record = Self::with_id(unit, &fields);
        records.insert(unit.clone(), fields);
        Ok(record)
    }

    fn update(&self, unit: &UnitKey, fields: Fields) -> Result<(), ConductorError> {
        self.check_reachable()?;
        if self.failing_updates.lock().unwrap().contains(unit) {
            return Err(ConductorError::CharonStatus {
                status: 500,
                message: "internal error".to_string(),
            });
        }
        let mut records = self.records.lock().unwrap();
        let existing = records
            .get_mut(unit)
            .ok_or_else(|| ConductorError::CharonNotFound(unit.to_string()))?;
        existing.extend(fields);
        Ok(())
    }

    fn reset(&self, unit: &UnitKey) -> Result<(), ConductorError> {
        self.check_reachable()?;
        let mut records = self.records.lock().unwrap();
        let existing = records
            .get_mut(unit)
            .ok_or_else(|| ConductorError::CharonNotFound(unit.to_string()))?;
        for field in ["alignment_status", "analysis_status", "total_reads"] {
            existing.remove(field);
        }
        self.resets.lock().unwrap().push(unit.clone());
        Ok(())
    }

    fn list_children(&self, parent: &UnitKey) -> Result<Vec<CharonRecord>, ConductorError> {
        self.check_reachable()?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|(unit, _)| unit.parent().as_ref() == Some(parent))
            .map(|(unit, fields)| Self::with_id(unit, fields))
            .collect())
    }

    fn list_projects(&self) -> Result<Vec<CharonRecord>, ConductorError> {
        self.check_reachable()?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|(unit, _)| unit.parent().is_none())
            .map(|(unit, fields)| Self::with_id(unit, fields))
            .collect())
    }
}

/// Pretends to launch processes; exit codes are set by the test.
#[derive(Default)]
pub struct MockConnector {
    pub launched: Mutex<Vec<LaunchRequest>>,
    pub exit_codes: Mutex<BTreeMap<String, i32>>,
    pub polls: Mutex<usize>,
    pub cleaned: Mutex<Vec<Utf8PathBuf>>,
    pub fail_launches: Mutex<bool>,
}

impl MockConnector {
    pub fn finish(&self, process_id: &str, exit_code: i32) {
        self.exit_codes
            .lock()
            .unwrap()
            .insert(process_id.to_string(), exit_code);
    }
}

impl ProcessConnector for MockConnector {
    fn executor(&self) -> ExecutorKind {
        ExecutorKind::Local
    }

    fn execute(&self, request: &LaunchRequest) -> Result<String, ConductorError> {
        if *self.fail_launches.lock().unwrap() {
            return Err(ConductorError::ProcessLaunch("mock refused".to_string()));
        }
        let mut launched = self.launched.lock().unwrap();
        launched.push(request.clone());
        Ok(format!("{}", 1000 + launched.len()))
    }

    fn poll(
        &self,
        process_id: &str,
        _exit_code_path: &Utf8Path,
    ) -> Result<Option<i32>, ConductorError> {
        *self.polls.lock().unwrap() += 1;
        Ok(self.exit_codes.lock().unwrap().get(process_id).copied())
    }

    fn cancel(&self, _process_id: &str) -> Result<(), ConductorError> {
        Ok(())
    }

    fn cleanup(&self, work_dir: &Utf8Path) {
        self.cleaned.lock().unwrap().push(work_dir.to_path_buf());
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.notices.lock().unwrap().len()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: &Notice) {
        self.notices.lock().unwrap().push(notice.clone());
    }
}

/// Workflow that runs `true` and reports fixed metrics.
pub struct EchoWorkflow {
    pub broken_metrics: bool,
}

impl WorkflowAdapter for EchoWorkflow {
    fn name(&self) -> &str {
        "echo"
    }

    fn engine(&self) -> &str {
        "echo_engine"
    }

    fn processing_steps(
        &self,
        target: &AnalysisTarget<'_>,
    ) -> Result<Vec<ProcessingStep>, ConductorError> {
        Ok(vec![
            ProcessingStep::new("true").args(target.samples.iter().map(|s| s.id.clone())),
        ])
    }

    fn generate_work_manifest(
        &self,
        target: &AnalysisTarget<'_>,
    ) -> Result<Vec<Vec<String>>, ConductorError> {
        Ok(target.samples.iter().map(|s| vec![s.id.clone()]).collect())
    }

    fn collect_metrics(
        &self,
        _results_dir: &Utf8Path,
    ) -> Result<Option<AnalysisMetrics>, ConductorError> {
        if self.broken_metrics {
            return Err(ConductorError::MetricParse("no genome_results.txt".to_string()));
        }
        Ok(Some(AnalysisMetrics {
            total_reads: Some(1000),
            autosomal_coverage: Some(30.5),
            percent_duplication: Some(7.0),
        }))
    }
}

pub fn registry(broken_metrics: bool) -> WorkflowRegistry {
    let mut best_practice = BTreeMap::new();
    best_practice.insert("wgs_germline".to_string(), "echo".to_string());
    let mut registry = WorkflowRegistry::new(best_practice);
    registry.register(Box::new(EchoWorkflow { broken_metrics }));
    registry
}

pub fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

pub fn tracking_store(root: &Utf8Path) -> TrackingStore {
    TrackingStore::new(root.join("tracking.json"))
}

/// Project `P1` with one libprep `A` and one seqrun per sample.
pub fn project(root: &Utf8Path, samples: &[&str]) -> Project {
    let mut project = Project::new("P1", "A.Name_20_01", root.to_path_buf());
    project.best_practice_analysis = Some("wgs_germline".to_string());
    for sample_id in samples {
        let mut seqrun = SequencingRun::new(SEQRUN);
        seqrun.add_fastq_file(format!("{sample_id}_S1_L001_R1_001.fastq.gz"));
        seqrun.add_fastq_file(format!("{sample_id}_S1_L001_R2_001.fastq.gz"));
        project
            .add_sample(Sample::new(*sample_id))
            .add_libprep(LibraryPrep::new("A"))
            .add_seqrun(seqrun);
    }
    project
}

/// Charon records matching [`project`], all fresh.
pub fn charon_for(samples: &[&str]) -> MockCharon {
    let mut charon = MockCharon::default().with(
        UnitKey::project("P1"),
        json!({"name": "A.Name_20_01", "status": "OPEN", "best_practice_analysis": "wgs_germline"}),
    );
    for sample in samples {
        charon = charon
            .with(
                UnitKey::sample("P1", *sample),
                json!({"analysis_status": "TO_ANALYZE"}),
            )
            .with(UnitKey::libprep("P1", *sample, "A"), json!({"qc": "PASSED"}))
            .with(
                UnitKey::seqrun("P1", *sample, "A", SEQRUN),
                json!({"alignment_status": "NOT_RUNNING"}),
            );
    }
    charon
}

pub fn connector(charon: MockCharon) -> StatusConnector<MockCharon> {
    StatusConnector::new(charon)
}
