use serde::Serialize;
use tracing::{error, info, warn};

use crate::charon::{CharonClient, StatusConnector};
use crate::domain::{Project, Sample, UnitKey};
use crate::error::ConductorError;
use crate::notify::{Notice, Notifier};
use crate::status::{
    RestartPolicy, SAMPLE_ANALYSIS, SEQRUN_ALIGNMENT, StatusClass, StatusVocabulary,
    libprep_qc_allows_start, status_should_be_started,
};
use crate::tracking::TrackingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Running,
    Finished,
    Failed,
    QcFailed,
    Incongruent,
    NoEligibleSeqruns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Start,
    Skip(SkipReason),
}

impl Decision {
    pub fn is_start(&self) -> bool {
        matches!(self, Decision::Start)
    }
}

/// Decides per work unit whether to launch, from the Charon status, the
/// local tracking store and the restart policy.
pub struct ReconciliationEngine<'a, C: CharonClient> {
    charon: &'a StatusConnector<C>,
    tracking: &'a TrackingStore,
    notifier: &'a dyn Notifier,
}

impl<'a, C: CharonClient> ReconciliationEngine<'a, C> {
    pub fn new(
        charon: &'a StatusConnector<C>,
        tracking: &'a TrackingStore,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            charon,
            tracking,
            notifier,
        }
    }

    pub fn sample_should_be_started(
        &self,
        project_id: &str,
        sample: &str,
        restart: &RestartPolicy,
    ) -> Result<bool, ConductorError> {
        Ok(self.evaluate_sample(project_id, sample, restart)?.is_start())
    }

    pub fn libprep_should_be_started(
        &self,
        project_id: &str,
        sample: &str,
        libprep: &str,
        start_failed_libpreps: bool,
    ) -> Result<bool, ConductorError> {
        Ok(self
            .evaluate_libprep(project_id, sample, libprep, start_failed_libpreps)?
            .is_start())
    }

    pub fn seqrun_should_be_started(
        &self,
        project_id: &str,
        sample: &str,
        libprep: &str,
        seqrun: &str,
        restart: &RestartPolicy,
    ) -> Result<bool, ConductorError> {
        Ok(self
            .evaluate_seqrun(project_id, sample, libprep, seqrun, restart)?
            .is_start())
    }

    pub fn evaluate_sample(
        &self,
        project_id: &str,
        sample: &str,
        restart: &RestartPolicy,
    ) -> Result<Decision, ConductorError> {
        let unit = UnitKey::sample(project_id, sample);
        let status = self.charon.status(&unit)?;
        let tracked = !self
            .tracking
            .open_for_read()?
            .keys_within_sample(project_id, sample)
            .is_empty();
        let decision = self.decide(&unit, &SAMPLE_ANALYSIS, status.as_deref(), tracked, restart);
        log_decision(&unit, "sample analysis", status.as_deref(), decision);
        Ok(decision)
    }

    pub fn evaluate_libprep(
        &self,
        project_id: &str,
        sample: &str,
        libprep: &str,
        start_failed_libpreps: bool,
    ) -> Result<Decision, ConductorError> {
        let unit = UnitKey::libprep(project_id, sample, libprep);
        let qc = self.charon.status(&unit)?;
        let decision = if libprep_qc_allows_start(qc.as_deref(), start_failed_libpreps) {
            Decision::Start
        } else {
            Decision::Skip(SkipReason::QcFailed)
        };
        log_decision(&unit, "libprep QC", qc.as_deref(), decision);
        Ok(decision)
    }

    pub fn evaluate_seqrun(
        &self,
        project_id: &str,
        sample: &str,
        libprep: &str,
        seqrun: &str,
        restart: &RestartPolicy,
    ) -> Result<Decision, ConductorError> {
        let unit = UnitKey::seqrun(project_id, sample, libprep, seqrun);
        let status = self.charon.status(&unit)?;
        let tracked = {
            let guard = self.tracking.open_for_read()?;
            guard.contains(&unit) || guard.contains(&UnitKey::sample(project_id, sample))
        };
        let decision = self.decide(&unit, &SEQRUN_ALIGNMENT, status.as_deref(), tracked, restart);
        log_decision(&unit, "seqrun alignment", status.as_deref(), decision);
        Ok(decision)
    }

    /// Copy of `sample` holding only the libpreps and seqruns that pass their
    /// gates. `None` when nothing is left to analyze.
    pub fn select_for_analysis(
        &self,
        project: &Project,
        sample: &Sample,
        restart: &RestartPolicy,
        start_failed_libpreps: bool,
    ) -> Result<Option<Sample>, ConductorError> {
        let mut selected = sample.clone();
        let mut rejected_libpreps = Vec::new();
        for libprep in sample.libpreps() {
            if !self.libprep_should_be_started(
                &project.id,
                &sample.id,
                &libprep.id,
                start_failed_libpreps,
            )? {
                rejected_libpreps.push(libprep.id.clone());
                continue;
            }
            let mut rejected_seqruns = Vec::new();
            for seqrun in libprep.seqruns() {
                if !self.seqrun_should_be_started(
                    &project.id,
                    &sample.id,
                    &libprep.id,
                    &seqrun.id,
                    restart,
                )? {
                    rejected_seqruns.push(seqrun.id.clone());
                }
            }
            if let Some(kept) = selected.libpreps_mut().find(|l| l.id == libprep.id) {
                kept.retain_seqruns(|seqrun| !rejected_seqruns.contains(&seqrun.id));
            }
        }
        selected.retain_libpreps(|libprep| {
            !rejected_libpreps.contains(&libprep.id) && libprep.seqruns().next().is_some()
        });

        if !selected.has_seqruns() {
            info!(
                project = %project.id,
                sample = %sample.id,
                "{} - {}: no libpreps or seqruns eligible for analysis",
                project.id,
                sample.id
            );
            return Ok(None);
        }
        Ok(Some(selected))
    }

    fn decide(
        &self,
        unit: &UnitKey,
        vocabulary: &StatusVocabulary,
        status: Option<&str>,
        tracked: bool,
        restart: &RestartPolicy,
    ) -> Decision {
        let class = vocabulary.classify(status);
        if class == StatusClass::Running && !tracked {
            self.report_incongruency(unit, status.unwrap_or_default());
            return Decision::Skip(SkipReason::Incongruent);
        }
        if tracked && class != StatusClass::Running {
            warn!(
                unit = %unit,
                status = status.unwrap_or("unset"),
                "process tracked locally but not yet reported as running"
            );
        }
        let effective = if tracked { StatusClass::Running } else { class };
        let start = match effective {
            StatusClass::Running => restart.restart_running,
            _ => status_should_be_started(vocabulary, status, restart),
        };
        if start {
            Decision::Start
        } else {
            Decision::Skip(match effective {
                StatusClass::Running => SkipReason::Running,
                StatusClass::Finished => SkipReason::Finished,
                StatusClass::Failed | StatusClass::Fresh => SkipReason::Failed,
            })
        }
    }

    fn report_incongruency(&self, unit: &UnitKey, status: &str) {
        let err = ConductorError::Incongruency {
            unit: unit.to_string(),
            status: status.to_string(),
        };
        error!(kind = "db_incongruency", unit = %unit, status, "{err}");
        let mut notice = Notice::error(unit.project_id(), err.to_string());
        if let Some(sample) = unit.sample_id() {
            notice = notice.with_sample(sample);
        }
        self.notifier.notify(&notice);
    }
}

fn log_decision(unit: &UnitKey, what: &str, status: Option<&str>, decision: Decision) {
    let status = status.unwrap_or("unset");
    let verdict = if decision.is_start() { "will" } else { "will NOT" };
    info!(
        unit = %unit,
        status,
        ?decision,
        "{unit}: {what} status is '{status}' -> {} {verdict} be included",
        unit.level()
    );
}
