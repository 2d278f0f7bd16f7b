use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::charon::{CharonClient, StatusConnector};
use crate::domain::{Project, Sample, UnitKey};
use crate::engine::{Decision, ReconciliationEngine, SkipReason};
use crate::error::ConductorError;
use crate::notify::{Notice, Notifier};
use crate::process::{LaunchRequest, ProcessConnector};
use crate::status::{ProcessStatus, RestartPolicy};
use crate::tracking::{ProcessHandle, TrackingRecord, TrackingStore, TrackingWriteGuard};
use crate::workflow::{AnalysisLayout, AnalysisTarget, WorkflowAdapter, WorkflowRegistry};

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub restart: RestartPolicy,
    /// One job for every eligible sample of the project.
    pub batch: bool,
    pub start_failed_libpreps: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LaunchOutcome {
    Launched { process: String },
    Skipped { reason: SkipReason },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitLaunch {
    pub unit: UnitKey,
    pub workflow: String,
    #[serde(flatten)]
    pub outcome: LaunchOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LaunchReport {
    pub project: String,
    pub units: Vec<UnitLaunch>,
}

impl LaunchReport {
    fn new(project: &Project) -> Self {
        Self {
            project: project.id.clone(),
            units: Vec::new(),
        }
    }

    fn push(&mut self, unit: UnitKey, workflow: &str, outcome: LaunchOutcome) {
        self.units.push(UnitLaunch {
            unit,
            workflow: workflow.to_string(),
            outcome,
        });
    }

    pub fn launched(&self) -> usize {
        self.units
            .iter()
            .filter(|u| matches!(u.outcome, LaunchOutcome::Launched { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.units
            .iter()
            .filter(|u| matches!(u.outcome, LaunchOutcome::Failed { .. }))
            .count()
    }
}

/// Walks a project's samples, asks the reconciliation engine about each and
/// launches the approved ones.
pub struct Launcher<'a, C: CharonClient> {
    charon: &'a StatusConnector<C>,
    tracking: &'a TrackingStore,
    executor: &'a dyn ProcessConnector,
    workflows: &'a WorkflowRegistry,
    notifier: &'a dyn Notifier,
}

impl<'a, C: CharonClient> Launcher<'a, C> {
    pub fn new(
        charon: &'a StatusConnector<C>,
        tracking: &'a TrackingStore,
        executor: &'a dyn ProcessConnector,
        workflows: &'a WorkflowRegistry,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            charon,
            tracking,
            executor,
            workflows,
            notifier,
        }
    }

    fn engine(&self) -> ReconciliationEngine<'_, C> {
        ReconciliationEngine::new(self.charon, self.tracking, self.notifier)
    }

    /// Best-practice label from Charon, falling back to the one on `project`.
    pub fn workflow_for(&self, project: &Project) -> Result<&dyn WorkflowAdapter, ConductorError> {
        let remote = match self.charon.best_practice_analysis(&project.id) {
            Ok(label) => label,
            Err(err) if err.is_systemic() => return Err(err),
            Err(err) => {
                warn!(project = %project.id, error = %err, "could not read best practice analysis");
                None
            }
        };
        let label = remote
            .or_else(|| project.best_practice_analysis.clone())
            .ok_or_else(|| {
                ConductorError::UnknownWorkflow(format!("no best practice analysis for {}", project.id))
            })?;
        self.workflows.for_best_practice(&label)
    }

    pub fn analyze_project(
        &self,
        project: &Project,
        options: &LaunchOptions,
    ) -> Result<LaunchReport, ConductorError> {
        let workflow = self.workflow_for(project)?;
        info!(
            project = %project.id,
            workflow = workflow.name(),
            batch = options.batch,
            "analyzing project"
        );
        if options.batch {
            self.analyze_batch(project, workflow, options)
        } else {
            self.analyze_per_sample(project, workflow, options)
        }
    }

    fn analyze_per_sample(
        &self,
        project: &Project,
        workflow: &dyn WorkflowAdapter,
        options: &LaunchOptions,
    ) -> Result<LaunchReport, ConductorError> {
        let mut report = LaunchReport::new(project);
        for sample in project.samples() {
            let unit = UnitKey::sample(project.id.as_str(), sample.id.as_str());
            let outcome = match self.select_sample(project, sample, options) {
                Ok(Ok(selected)) => {
                    let target = AnalysisTarget {
                        project,
                        samples: vec![selected],
                        layout: workflow.layout_for_sample(project, &sample.id),
                    };
                    match self.launch(workflow, &target) {
                        Ok(handle) => LaunchOutcome::Launched {
                            process: handle.to_string(),
                        },
                        Err(err) => self.launch_failed(project, Some(&sample.id), workflow, err)?,
                    }
                }
                Ok(Err(reason)) => LaunchOutcome::Skipped { reason },
                Err(err) => self.launch_failed(project, Some(&sample.id), workflow, err)?,
            };
            report.push(unit, workflow.name(), outcome);
        }
        Ok(report)
    }

    fn analyze_batch(
        &self,
        project: &Project,
        workflow: &dyn WorkflowAdapter,
        options: &LaunchOptions,
    ) -> Result<LaunchReport, ConductorError> {
        let mut report = LaunchReport::new(project);
        let mut selected = Vec::new();
        for sample in project.samples() {
            let unit = UnitKey::sample(project.id.as_str(), sample.id.as_str());
            match self.select_sample(project, sample, options) {
                Ok(Ok(sample)) => selected.push(sample),
                Ok(Err(reason)) => report.push(unit, workflow.name(), LaunchOutcome::Skipped { reason }),
                Err(err) => {
                    let outcome = self.launch_failed(project, Some(&sample.id), workflow, err)?;
                    report.push(unit, workflow.name(), outcome);
                }
            }
        }
        if selected.is_empty() {
            info!(project = %project.id, "no samples eligible for batch analysis");
            return Ok(report);
        }

        let keys: Vec<UnitKey> = selected
            .iter()
            .map(|sample| UnitKey::sample(project.id.as_str(), sample.id.as_str()))
            .collect();
        let target = AnalysisTarget {
            project,
            samples: selected,
            layout: workflow.layout_for_project(project),
        };
        let outcome = match self.launch(workflow, &target) {
            Ok(handle) => LaunchOutcome::Launched {
                process: handle.to_string(),
            },
            Err(err) => self.launch_failed(project, None, workflow, err)?,
        };
        for key in keys {
            report.push(key, workflow.name(), outcome.clone());
        }
        Ok(report)
    }

    /// The eligible part of `sample`, or why it is skipped.
    fn select_sample(
        &self,
        project: &Project,
        sample: &Sample,
        options: &LaunchOptions,
    ) -> Result<Result<Sample, SkipReason>, ConductorError> {
        let engine = self.engine();
        let decision = engine.evaluate_sample(&project.id, &sample.id, &options.restart)?;
        if let Decision::Skip(reason) = decision {
            return Ok(Err(reason));
        }
        let selected = engine.select_for_analysis(
            project,
            sample,
            &options.restart,
            options.start_failed_libpreps,
        )?;
        Ok(selected.ok_or(SkipReason::NoEligibleSeqruns))
    }

    /// Starts `target` and records one tracking entry per sample before
    /// returning.
    fn launch(
        &self,
        workflow: &dyn WorkflowAdapter,
        target: &AnalysisTarget<'_>,
    ) -> Result<ProcessHandle, ConductorError> {
        let project = target.project;
        let keys: Vec<UnitKey> = target
            .samples
            .iter()
            .map(|sample| UnitKey::sample(project.id.as_str(), sample.id.as_str()))
            .collect();

        workflow.write_work_manifest(target)?;
        let command = workflow.command_line(target)?;
        let request = launch_request(&target.layout, command);
        let id = self.executor.execute(&request)?;
        let handle = ProcessHandle {
            executor: self.executor.executor(),
            id,
        };
        info!(
            project = %project.id,
            workflow = workflow.name(),
            process = %handle,
            samples = keys.len(),
            "launched analysis"
        );

        let record = TrackingRecord {
            workflow: workflow.name().to_string(),
            engine: workflow.engine().to_string(),
            process: handle.clone(),
            project_base_path: project.base_path.clone(),
            analysis_dir: target.layout.analysis_dir.clone(),
            results_dir: target.layout.results_dir.clone(),
            work_dir: target.layout.work_dir.clone(),
            exit_code_path: target.layout.exit_code_path.clone(),
            run_dir: None,
            recorded_at: Utc::now(),
        };
        let recorded = self.tracking.open_for_write().and_then(|mut guard| {
            drop_stale_records(&mut guard, &keys)?;
            for key in &keys {
                guard.record(key, record.clone());
            }
            guard.commit()
        });
        if let Err(err) = recorded {
            error!(process = %handle, error = %err, "launched process could not be recorded");
            return Err(err);
        }

        for key in &keys {
            if let Err(err) = self.charon.report_process_status(key, ProcessStatus::Running) {
                warn!(unit = %key, error = %err, "could not mark analysis as running");
            }
        }
        Ok(handle)
    }

    fn launch_failed(
        &self,
        project: &Project,
        sample: Option<&str>,
        workflow: &dyn WorkflowAdapter,
        err: ConductorError,
    ) -> Result<LaunchOutcome, ConductorError> {
        if err.is_systemic() {
            return Err(err);
        }
        error!(
            project = %project.id,
            sample = sample.unwrap_or("-"),
            workflow = workflow.name(),
            error = %err,
            "could not launch analysis"
        );
        let mut notice = Notice::error(&project.name, format!("analysis launch failed: {err}"))
            .with_workflow(workflow.name());
        if let Some(sample) = sample {
            notice = notice.with_sample(sample);
        }
        self.notifier.notify(&notice);
        Ok(LaunchOutcome::Failed {
            error: err.to_string(),
        })
    }

    /// Fastq QC for every sample. Not tracked; a sample whose QC results
    /// exist is skipped unless `force_rerun`.
    pub fn qc_project(
        &self,
        project: &Project,
        force_rerun: bool,
    ) -> Result<LaunchReport, ConductorError> {
        let workflow = self.workflows.get("qc")?;
        let mut report = LaunchReport::new(project);
        for sample in project.samples() {
            let unit = UnitKey::sample(project.id.as_str(), sample.id.as_str());
            let layout = workflow.layout_for_sample(project, &sample.id);
            if !force_rerun && has_results(&layout) {
                info!(unit = %unit, "QC results exist, skipping");
                report.push(
                    unit,
                    workflow.name(),
                    LaunchOutcome::Skipped {
                        reason: SkipReason::Finished,
                    },
                );
                continue;
            }
            let target = AnalysisTarget {
                project,
                samples: vec![sample.clone()],
                layout,
            };
            let launched = workflow
                .command_line(&target)
                .and_then(|command| self.executor.execute(&launch_request(&target.layout, command)));
            let outcome = match launched {
                Ok(id) => {
                    info!(unit = %unit, process = %id, "launched QC");
                    LaunchOutcome::Launched { process: id }
                }
                Err(err) => self.launch_failed(project, Some(&sample.id), workflow, err)?,
            };
            report.push(unit, workflow.name(), outcome);
        }
        Ok(report)
    }
}

fn launch_request(layout: &AnalysisLayout, command: String) -> LaunchRequest {
    LaunchRequest {
        command,
        working_dir: layout.analysis_dir.clone(),
        exit_code_path: layout.exit_code_path.clone(),
        job_name: layout.job_name.clone(),
    }
}

fn has_results(layout: &AnalysisLayout) -> bool {
    std::fs::read_dir(layout.results_dir.as_std_path())
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Removes records left by an earlier launch of the same samples. Only
/// reached when the engine approved a restart of running work, and only
/// once the replacement process has started.
fn drop_stale_records(
    guard: &mut TrackingWriteGuard,
    keys: &[UnitKey],
) -> Result<(), ConductorError> {
    for key in keys {
        let (Some(sample), project) = (key.sample_id(), key.project_id()) else {
            continue;
        };
        for stale in guard.keys_within_sample(project, sample) {
            if let Some(record) = guard.get(&stale) {
                warn!(unit = %stale, process = %record.process, "replacing tracked process");
            }
            guard.remove(&stale)?;
        }
    }
    Ok(())
}
