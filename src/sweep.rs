use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::charon::{CharonClient, StatusConnector};
use crate::domain::{UnitKey, UnitLevel};
use crate::error::ConductorError;
use crate::metrics::AnalysisMetrics;
use crate::notify::{Notice, Notifier};
use crate::process::ProcessConnector;
use crate::status::{ProcessStatus, StatusClass, StatusVocabulary};
use crate::tracking::{ProcessHandle, TrackingRecord, TrackingStore};
use crate::workflow::WorkflowRegistry;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SweepOutcome {
    Running,
    Reported { status: ProcessStatus },
    WritebackFailed { error: String },
    PollFailed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SweptUnit {
    pub unit: UnitKey,
    pub process: String,
    #[serde(flatten)]
    pub outcome: SweepOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub units: Vec<SweptUnit>,
    pub removed: usize,
}

impl SweepReport {
    fn push(&mut self, unit: &UnitKey, handle: &ProcessHandle, outcome: SweepOutcome) {
        self.units.push(SweptUnit {
            unit: unit.clone(),
            process: handle.to_string(),
            outcome,
        });
    }
}

/// Records sharing one process handle. A batched launch produces one group
/// with a member per sample.
struct Group {
    handle: ProcessHandle,
    members: Vec<(UnitKey, TrackingRecord)>,
}

/// Polls every tracked process, writes finished ones back to Charon and
/// forgets them once Charon has the result.
pub struct StatusSweep<'a, C: CharonClient> {
    charon: &'a StatusConnector<C>,
    tracking: &'a TrackingStore,
    workflows: &'a WorkflowRegistry,
    notifier: &'a dyn Notifier,
    connectors: Vec<&'a dyn ProcessConnector>,
}

impl<'a, C: CharonClient> StatusSweep<'a, C> {
    pub fn new(
        charon: &'a StatusConnector<C>,
        tracking: &'a TrackingStore,
        workflows: &'a WorkflowRegistry,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            charon,
            tracking,
            workflows,
            notifier,
            connectors: Vec::new(),
        }
    }

    pub fn with_connector(mut self, connector: &'a dyn ProcessConnector) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn run(&self) -> Result<SweepReport, ConductorError> {
        let records = self.tracking.all_records()?;
        let mut groups: Vec<Group> = Vec::new();
        for (key, record) in records {
            match groups.iter_mut().find(|g| g.handle == record.process) {
                Some(group) => group.members.push((key, record)),
                None => groups.push(Group {
                    handle: record.process.clone(),
                    members: vec![(key, record)],
                }),
            }
        }
        info!(processes = groups.len(), "sweeping tracked processes");

        let mut report = SweepReport::default();
        for group in &groups {
            self.sweep_group(group, &mut report)?;
        }
        info!(
            units = report.units.len(),
            removed = report.removed,
            "status sweep finished"
        );
        Ok(report)
    }

    fn sweep_group(&self, group: &Group, report: &mut SweepReport) -> Result<(), ConductorError> {
        let handle = &group.handle;
        let exit_code = match self.poll(group) {
            Ok(exit_code) => exit_code,
            Err(err) if err.is_systemic() => return Err(err),
            Err(err) => {
                error!(process = %handle, error = %err, "could not poll process, keeping records");
                for (key, _) in &group.members {
                    report.push(key, handle, SweepOutcome::PollFailed { error: err.to_string() });
                }
                return Ok(());
            }
        };

        let Some(exit_code) = exit_code else {
            for (key, _) in &group.members {
                let outcome = match self.ensure_running(key) {
                    Ok(()) => SweepOutcome::Running,
                    Err(err) if err.is_systemic() => return Err(err),
                    Err(err) => {
                        error!(unit = %key, error = %err, "could not check running analysis in Charon");
                        SweepOutcome::WritebackFailed { error: err.to_string() }
                    }
                };
                report.push(key, handle, outcome);
            }
            return Ok(());
        };

        let process = ProcessStatus::from_exit_code(Some(exit_code));
        info!(process = %handle, exit_code, members = group.members.len(), "process finished");
        let batched = group.members.len() > 1;
        let mut all_written = true;
        for (key, record) in &group.members {
            let outcome = match self.write_back(key, record, process, batched) {
                Ok(status) => SweepOutcome::Reported { status },
                Err(err) if err.is_systemic() => return Err(err),
                Err(err) => {
                    error!(unit = %key, error = %err, "could not write analysis result to Charon");
                    all_written = false;
                    SweepOutcome::WritebackFailed { error: err.to_string() }
                }
            };
            report.push(key, handle, outcome);
        }
        if !all_written {
            warn!(process = %handle, "keeping tracking records until every writeback succeeds");
            return Ok(());
        }

        let mut guard = self.tracking.open_for_write()?;
        for (key, _) in &group.members {
            match guard.remove(key) {
                Ok(_) => report.removed += 1,
                Err(err) => warn!(unit = %key, error = %err, "tracking record already gone"),
            }
        }
        guard.commit()?;

        if process == ProcessStatus::Succeeded {
            if let (Some(connector), Some((_, record))) =
                (self.connector_for(handle), group.members.first())
            {
                connector.cleanup(&record.work_dir);
            }
        }
        Ok(())
    }

    fn connector_for(&self, handle: &ProcessHandle) -> Option<&'a dyn ProcessConnector> {
        self.connectors
            .iter()
            .copied()
            .find(|connector| connector.executor() == handle.executor)
    }

    fn poll(&self, group: &Group) -> Result<Option<i32>, ConductorError> {
        let connector = self.connector_for(&group.handle).ok_or_else(|| {
            ConductorError::ProcessLaunch(format!("no connector for {}", group.handle))
        })?;
        let exit_code_path = group
            .members
            .first()
            .map(|(_, record)| record.exit_code_path.as_path())
            .ok_or_else(|| ConductorError::TrackingRecordMissing(group.handle.to_string()))?;
        connector.poll(&group.handle.id, exit_code_path)
    }

    fn ensure_running(&self, key: &UnitKey) -> Result<(), ConductorError> {
        let Some(vocabulary) = StatusVocabulary::for_level(key.level()) else {
            return Ok(());
        };
        let status = self.charon.status(key)?;
        if vocabulary.classify(status.as_deref()) == StatusClass::Running {
            debug!(unit = %key, "still running");
            return Ok(());
        }
        match self.charon.report_process_status(key, ProcessStatus::Running) {
            Ok(()) => Ok(()),
            Err(err) if err.is_systemic() => Err(err),
            Err(err) => {
                warn!(unit = %key, error = %err, "could not mark analysis as running");
                Ok(())
            }
        }
    }

    /// Writes the outcome for one member and returns the status it reported.
    /// A successful run whose metrics cannot be read is reported as failed.
    fn write_back(
        &self,
        key: &UnitKey,
        record: &TrackingRecord,
        process: ProcessStatus,
        batched: bool,
    ) -> Result<ProcessStatus, ConductorError> {
        let mut reported = process;
        let mut metrics = None;
        if process == ProcessStatus::Succeeded && !batched {
            match self.collect_metrics(record) {
                Ok(collected) => metrics = collected,
                Err(err) => {
                    error!(unit = %key, error = %err, "could not read analysis metrics, reporting failure");
                    reported = ProcessStatus::Failed(1);
                }
            }
        }

        if key.level() == UnitLevel::Seqrun && reported != ProcessStatus::Succeeded {
            self.charon.reset(key)?;
        }
        self.charon.report_process_status(key, reported)?;
        if let (Some(metrics), UnitKey::Sample { project, sample }) = (&metrics, key) {
            self.charon.set_sample_metrics(project, sample, metrics)?;
        }

        if reported != ProcessStatus::Succeeded {
            let mut notice = Notice::warn(
                key.project_id(),
                format!("analysis of {key} ended as {reported:?}, see {}", record.analysis_dir),
            )
            .with_workflow(&record.workflow);
            if let Some(sample) = key.sample_id() {
                notice = notice.with_sample(sample);
            }
            self.notifier.notify(&notice);
        }
        Ok(reported)
    }

    fn collect_metrics(
        &self,
        record: &TrackingRecord,
    ) -> Result<Option<AnalysisMetrics>, ConductorError> {
        self.workflows
            .get(&record.workflow)?
            .collect_metrics(&record.results_dir)
    }
}
