use std::io::{self, Write};

use serde::Serialize;

use crate::launcher::{LaunchOutcome, LaunchReport};
use crate::organizer::{Registration, RegistrationReport};
use crate::sweep::{SweepOutcome, SweepReport};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

impl OutputMode {
    pub fn from_flag(non_interactive: bool) -> Self {
        if non_interactive {
            OutputMode::NonInteractive
        } else {
            OutputMode::Interactive
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self, OutputMode::Interactive)
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// One-line summaries for a terminal.
pub struct TextOutput;

impl TextOutput {
    pub fn registration_summary(report: &RegistrationReport) -> String {
        format!(
            "{}: {} created, {} updated, {} already registered, {} failed",
            report.project,
            report.count(Registration::Created),
            report.count(Registration::Updated),
            report.count(Registration::Existing),
            report.count(Registration::Failed),
        )
    }

    pub fn launch_summary(report: &LaunchReport) -> String {
        let mut lines = vec![format!(
            "{}: {} launched, {} failed, {} skipped",
            report.project,
            report.launched(),
            report.failed(),
            report.units.len() - report.launched() - report.failed(),
        )];
        for unit in &report.units {
            let detail = match &unit.outcome {
                LaunchOutcome::Launched { process } => format!("launched ({process})"),
                LaunchOutcome::Skipped { reason } => format!("skipped ({reason:?})"),
                LaunchOutcome::Failed { error } => format!("failed: {error}"),
            };
            lines.push(format!("  {} [{}] {detail}", unit.unit, unit.workflow));
        }
        lines.join("\n")
    }

    pub fn sweep_summary(report: &SweepReport) -> String {
        let running = report
            .units
            .iter()
            .filter(|u| u.outcome == SweepOutcome::Running)
            .count();
        format!(
            "{} tracked units: {running} running, {} records removed",
            report.units.len(),
            report.removed
        )
    }

    pub fn print(text: &str) -> io::Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(text.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// JSON in non-interactive mode, `summary` otherwise.
pub fn emit<T: Serialize>(mode: OutputMode, value: &T, summary: impl FnOnce(&T) -> String) -> io::Result<()> {
    match mode {
        OutputMode::NonInteractive => JsonOutput::print_json(value),
        OutputMode::Interactive => TextOutput::print(&summary(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UnitKey;
    use crate::engine::SkipReason;
    use crate::launcher::UnitLaunch;

    #[test]
    fn launch_summary_counts_outcomes() {
        let report = LaunchReport {
            project: "P1".to_string(),
            units: vec![
                UnitLaunch {
                    unit: UnitKey::sample("P1", "P1_101"),
                    workflow: "sarek_germline".to_string(),
                    outcome: LaunchOutcome::Launched {
                        process: "pid 42".to_string(),
                    },
                },
                UnitLaunch {
                    unit: UnitKey::sample("P1", "P1_102"),
                    workflow: "sarek_germline".to_string(),
                    outcome: LaunchOutcome::Skipped {
                        reason: SkipReason::Finished,
                    },
                },
            ],
        };
        let summary = TextOutput::launch_summary(&report);
        assert!(summary.starts_with("P1: 1 launched, 0 failed, 1 skipped"));
        assert!(summary.contains("P1/P1_101 [sarek_germline] launched (pid 42)"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["units"][1]["outcome"], "skipped");
        assert_eq!(json["units"][1]["reason"], "finished");
        assert_eq!(json["units"][0]["unit"]["level"], "sample");
    }
}
