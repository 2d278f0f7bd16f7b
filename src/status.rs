use serde::{Deserialize, Serialize};

use crate::domain::UnitLevel;

/// Written by a connector when a process vanished without leaving an exit code.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

pub const QC_PASSED: &str = "PASSED";
pub const QC_FAILED: &str = "FAILED";
pub const SAMPLE_STALE: &str = "STALE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Succeeded,
    Failed(i32),
    Unknown,
}

impl ProcessStatus {
    pub fn from_exit_code(exit_code: Option<i32>) -> Self {
        match exit_code {
            None => ProcessStatus::Running,
            Some(0) => ProcessStatus::Succeeded,
            Some(UNKNOWN_EXIT_CODE) => ProcessStatus::Unknown,
            Some(code) => ProcessStatus::Failed(code),
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Running,
    Finished,
    Failed,
    Fresh,
}

/// Status strings recognized at one level of the hierarchy, and the values
/// written back for each process state.
#[derive(Debug)]
pub struct StatusVocabulary {
    pub level: UnitLevel,
    pub field: &'static str,
    pub fresh: &'static str,
    running: &'static [&'static str],
    finished: &'static [&'static str],
    failed: &'static [&'static str],
}

pub static PROJECT_STATUS: StatusVocabulary = StatusVocabulary {
    level: UnitLevel::Project,
    field: "status",
    fresh: "OPEN",
    running: &["RUNNING"],
    finished: &["CLOSED"],
    failed: &["FAILED"],
};

pub static SAMPLE_ANALYSIS: StatusVocabulary = StatusVocabulary {
    level: UnitLevel::Sample,
    field: "analysis_status",
    fresh: "TO_ANALYZE",
    running: &["UNDER_ANALYSIS", "RUNNING"],
    finished: &["ANALYZED", "DONE"],
    failed: &["FAILED"],
};

pub static SEQRUN_ALIGNMENT: StatusVocabulary = StatusVocabulary {
    level: UnitLevel::Seqrun,
    field: "alignment_status",
    fresh: "NOT_RUNNING",
    running: &["RUNNING"],
    finished: &["DONE"],
    failed: &["FAILED"],
};

impl StatusVocabulary {
    /// Libpreps carry a QC verdict instead of a run status.
    pub fn for_level(level: UnitLevel) -> Option<&'static StatusVocabulary> {
        match level {
            UnitLevel::Project => Some(&PROJECT_STATUS),
            UnitLevel::Sample => Some(&SAMPLE_ANALYSIS),
            UnitLevel::Seqrun => Some(&SEQRUN_ALIGNMENT),
            UnitLevel::Libprep => None,
        }
    }

    pub fn classify(&self, status: Option<&str>) -> StatusClass {
        let Some(status) = status.map(str::trim) else {
            return StatusClass::Fresh;
        };
        if self.running.contains(&status) {
            StatusClass::Running
        } else if self.finished.contains(&status) {
            StatusClass::Finished
        } else if self.failed.contains(&status) {
            StatusClass::Failed
        } else {
            StatusClass::Fresh
        }
    }

    /// Remote value reporting `process` at this level.
    pub fn status_for(&self, process: ProcessStatus) -> &'static str {
        match process {
            ProcessStatus::Running => self.running[0],
            ProcessStatus::Succeeded => self.finished[0],
            ProcessStatus::Failed(_) | ProcessStatus::Unknown => self.failed[0],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestartPolicy {
    pub restart_failed: bool,
    pub restart_finished: bool,
    pub restart_running: bool,
}

impl RestartPolicy {
    pub fn all() -> Self {
        Self {
            restart_failed: true,
            restart_finished: true,
            restart_running: true,
        }
    }
}

pub fn status_should_be_started(
    vocabulary: &StatusVocabulary,
    status: Option<&str>,
    policy: &RestartPolicy,
) -> bool {
    match vocabulary.classify(status) {
        StatusClass::Running => policy.restart_running,
        StatusClass::Finished => policy.restart_finished,
        StatusClass::Failed => policy.restart_failed,
        StatusClass::Fresh => true,
    }
}

pub fn libprep_qc_allows_start(qc: Option<&str>, start_failed_libpreps: bool) -> bool {
    qc.map(str::trim) != Some(QC_FAILED) || start_failed_libpreps
}

/// Seqrun alignment status implied by a sample analysis status.
pub fn alignment_status_for_analysis(analysis_status: &str) -> Option<&'static str> {
    match SAMPLE_ANALYSIS.classify(Some(analysis_status)) {
        StatusClass::Running => Some(SEQRUN_ALIGNMENT.running[0]),
        StatusClass::Finished => Some(SEQRUN_ALIGNMENT.finished[0]),
        StatusClass::Failed => Some(SEQRUN_ALIGNMENT.failed[0]),
        StatusClass::Fresh if analysis_status == SAMPLE_ANALYSIS.fresh => {
            Some(SEQRUN_ALIGNMENT.fresh)
        }
        StatusClass::Fresh => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policies() -> Vec<RestartPolicy> {
        let mut all = Vec::new();
        for bits in 0..8u8 {
            all.push(RestartPolicy {
                restart_failed: bits & 1 != 0,
                restart_finished: bits & 2 != 0,
                restart_running: bits & 4 != 0,
            });
        }
        all
    }

    #[test]
    fn decision_follows_class_for_every_policy() {
        for vocabulary in [&PROJECT_STATUS, &SAMPLE_ANALYSIS, &SEQRUN_ALIGNMENT] {
            for policy in policies() {
                for status in vocabulary.running {
                    assert_eq!(
                        status_should_be_started(vocabulary, Some(status), &policy),
                        policy.restart_running
                    );
                }
                for status in vocabulary.finished {
                    assert_eq!(
                        status_should_be_started(vocabulary, Some(status), &policy),
                        policy.restart_finished
                    );
                }
                for status in vocabulary.failed {
                    assert_eq!(
                        status_should_be_started(vocabulary, Some(status), &policy),
                        policy.restart_failed
                    );
                }
                assert!(status_should_be_started(vocabulary, None, &policy));
                assert!(status_should_be_started(vocabulary, Some(vocabulary.fresh), &policy));
                assert!(status_should_be_started(vocabulary, Some("SOMETHING_ELSE"), &policy));
            }
        }
    }

    #[test]
    fn vocabularies_are_per_level() {
        assert_eq!(SAMPLE_ANALYSIS.classify(Some("UNDER_ANALYSIS")), StatusClass::Running);
        assert_eq!(SEQRUN_ALIGNMENT.classify(Some("UNDER_ANALYSIS")), StatusClass::Fresh);
        assert_eq!(SEQRUN_ALIGNMENT.classify(Some("DONE")), StatusClass::Finished);
        assert_eq!(PROJECT_STATUS.classify(Some("DONE")), StatusClass::Fresh);
    }

    #[test]
    fn exit_codes_map_to_remote_values() {
        assert_eq!(
            SAMPLE_ANALYSIS.status_for(ProcessStatus::from_exit_code(None)),
            "UNDER_ANALYSIS"
        );
        assert_eq!(
            SAMPLE_ANALYSIS.status_for(ProcessStatus::from_exit_code(Some(0))),
            "ANALYZED"
        );
        assert_eq!(
            SAMPLE_ANALYSIS.status_for(ProcessStatus::from_exit_code(Some(137))),
            "FAILED"
        );
        assert_eq!(
            ProcessStatus::from_exit_code(Some(UNKNOWN_EXIT_CODE)),
            ProcessStatus::Unknown
        );
        assert_eq!(PROJECT_STATUS.status_for(ProcessStatus::Unknown), "FAILED");
        assert_eq!(PROJECT_STATUS.status_for(ProcessStatus::Succeeded), "CLOSED");
    }

    #[test]
    fn analysis_status_maps_to_alignment_status() {
        assert_eq!(alignment_status_for_analysis("TO_ANALYZE"), Some("NOT_RUNNING"));
        assert_eq!(alignment_status_for_analysis("UNDER_ANALYSIS"), Some("RUNNING"));
        assert_eq!(alignment_status_for_analysis("ANALYZED"), Some("DONE"));
        assert_eq!(alignment_status_for_analysis("FAILED"), Some("FAILED"));
        assert_eq!(alignment_status_for_analysis("STALE"), None);
    }

    #[test]
    fn failed_qc_needs_override() {
        assert!(libprep_qc_allows_start(Some("PASSED"), false));
        assert!(libprep_qc_allows_start(None, false));
        assert!(!libprep_qc_allows_start(Some("FAILED"), false));
        assert!(libprep_qc_allows_start(Some("FAILED"), true));
    }
}
