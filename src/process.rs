use std::fs;
use std::process::Command;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{ExecutorKind, SlurmConfig};
use crate::error::ConductorError;
use crate::fs_util;
use crate::status::UNKNOWN_EXIT_CODE;

static SUBMITTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Submitted batch job (\d+)").expect("valid sbatch pattern"));

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub command: String,
    pub working_dir: Utf8PathBuf,
    pub exit_code_path: Utf8PathBuf,
    pub job_name: String,
}

impl LaunchRequest {
    pub fn log_dir(&self) -> Utf8PathBuf {
        self.working_dir.join("logs")
    }
}

/// Starts work outside this process and reports on it later, possibly from a
/// different invocation.
pub trait ProcessConnector: Send + Sync {
    fn executor(&self) -> ExecutorKind;

    /// Returns the process id. The exit code ends up in
    /// `request.exit_code_path` whether or not this program is still alive.
    fn execute(&self, request: &LaunchRequest) -> Result<String, ConductorError>;

    /// `None` while the process runs.
    fn poll(&self, process_id: &str, exit_code_path: &Utf8Path)
    -> Result<Option<i32>, ConductorError>;

    fn cancel(&self, process_id: &str) -> Result<(), ConductorError>;

    fn cleanup(&self, work_dir: &Utf8Path) {
        if !work_dir.as_std_path().exists() {
            return;
        }
        match fs::remove_dir_all(work_dir.as_std_path()) {
            Ok(()) => debug!(path = %work_dir, "removed work directory"),
            Err(err) => warn!(path = %work_dir, error = %err, "could not remove work directory"),
        }
    }
}

/// First line of an exit-code file, if it holds a number.
pub fn read_exit_code(path: &Utf8Path) -> Option<i32> {
    let content = fs::read_to_string(path.as_std_path()).ok()?;
    content.lines().next()?.trim().parse::<i32>().ok()
}

pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "-_./=:+,".contains(ch))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn prepare_dirs(request: &LaunchRequest) -> Result<(), ConductorError> {
    fs_util::ensure_dir(&request.working_dir)?;
    fs_util::ensure_dir(&request.log_dir())?;
    if let Some(parent) = request.exit_code_path.parent() {
        fs_util::ensure_dir(parent)?;
    }
    if request.exit_code_path.as_std_path().exists() {
        fs::remove_file(request.exit_code_path.as_std_path()).map_err(|err| {
            ConductorError::Filesystem(format!("remove {}: {err}", request.exit_code_path))
        })?;
    }
    Ok(())
}

fn run_tool(program: &str, args: &[&str]) -> Result<String, ConductorError> {
    let output = Command::new(program).args(args).output().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ConductorError::MissingTool(program.to_string())
        } else {
            ConductorError::ProcessLaunch(format!("{program}: {err}"))
        }
    })?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).to_string());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("command failed: {program}")
    } else {
        format!("{program}: {stderr}")
    };
    Err(ConductorError::ProcessLaunch(message))
}

/// Runs commands as detached background shells on this host.
#[derive(Debug, Clone)]
pub struct LocalProcessConnector {
    shell: String,
}

impl Default for LocalProcessConnector {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl LocalProcessConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn wrapper(&self, request: &LaunchRequest) -> String {
        let log_dir = request.log_dir();
        let stdout = log_dir.join(format!("{}.out", request.job_name));
        let stderr = log_dir.join(format!("{}.err", request.job_name));
        let inner = format!(
            "( {} ) > {} 2> {}; echo $? > {}",
            request.command,
            shell_quote(stdout.as_str()),
            shell_quote(stderr.as_str()),
            shell_quote(request.exit_code_path.as_str()),
        );
        format!("( {inner} ) < /dev/null > /dev/null 2>&1 & echo $!")
    }

    fn is_alive(&self, pid: &str) -> bool {
        Command::new("kill")
            .args(["-0", pid])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

impl ProcessConnector for LocalProcessConnector {
    fn executor(&self) -> ExecutorKind {
        ExecutorKind::Local
    }

    fn execute(&self, request: &LaunchRequest) -> Result<String, ConductorError> {
        prepare_dirs(request)?;
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(self.wrapper(request))
            .current_dir(request.working_dir.as_std_path())
            .output()
            .map_err(|err| ConductorError::ProcessLaunch(format!("{}: {err}", self.shell)))?;
        if !output.status.success() {
            return Err(ConductorError::ProcessLaunch(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let pid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if pid.is_empty() || !pid.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(ConductorError::ProcessLaunch(format!(
                "unexpected pid output {pid:?}"
            )));
        }
        info!(job = %request.job_name, pid = %pid, "started local process");
        Ok(pid)
    }

    fn poll(
        &self,
        process_id: &str,
        exit_code_path: &Utf8Path,
    ) -> Result<Option<i32>, ConductorError> {
        if let Some(code) = read_exit_code(exit_code_path) {
            return Ok(Some(code));
        }
        if self.is_alive(process_id) {
            return Ok(None);
        }
        // The process may have written its code between the two checks.
        if let Some(code) = read_exit_code(exit_code_path) {
            return Ok(Some(code));
        }
        warn!(pid = process_id, path = %exit_code_path, "process gone without an exit code");
        Ok(Some(UNKNOWN_EXIT_CODE))
    }

    fn cancel(&self, process_id: &str) -> Result<(), ConductorError> {
        run_tool("kill", &[process_id]).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    Active(String),
    Completed,
    Failed(String),
}

/// First state token of `sacct -n -o STATE` output.
pub fn parse_sacct_state(job_id: &str, output: &str) -> Result<SchedulerState, ConductorError> {
    let token = output
        .split_whitespace()
        .next()
        .ok_or_else(|| ConductorError::SchedulerEmptyResponse(job_id.to_string()))?;
    let state = token.trim_end_matches('+');
    match state {
        "PENDING" | "RUNNING" | "RESIZING" | "SUSPENDED" | "REQUEUED" | "CONFIGURING"
        | "COMPLETING" => Ok(SchedulerState::Active(state.to_string())),
        "COMPLETED" => Ok(SchedulerState::Completed),
        "CANCELLED" | "FAILED" | "TIMEOUT" | "PREEMPTED" | "BOOT_FAIL" | "NODE_FAIL"
        | "OUT_OF_MEMORY" | "DEADLINE" => Ok(SchedulerState::Failed(state.to_string())),
        _ => Err(ConductorError::SchedulerUnrecognizedState {
            job_id: job_id.to_string(),
            state: token.to_string(),
        }),
    }
}

pub fn parse_submitted_job_id(output: &str) -> Option<String> {
    SUBMITTED_RE
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// Submits sbatch scripts and follows them through `sacct`.
#[derive(Debug, Clone)]
pub struct SlurmConnector {
    config: SlurmConfig,
    account: String,
    sbatch: String,
    sacct: String,
    scancel: String,
}

impl SlurmConnector {
    pub fn new(config: SlurmConfig) -> Result<Self, ConductorError> {
        let account = config
            .account
            .clone()
            .ok_or_else(|| ConductorError::MissingConfigKey("environment.project_id".to_string()))?;
        Ok(Self {
            config,
            account,
            sbatch: "sbatch".to_string(),
            sacct: "sacct".to_string(),
            scancel: "scancel".to_string(),
        })
    }

    pub fn script_path(&self, request: &LaunchRequest) -> Utf8PathBuf {
        request
            .working_dir
            .join("sbatch")
            .join(format!("{}.sbatch", request.job_name))
    }

    pub fn sbatch_script(&self, request: &LaunchRequest) -> String {
        let log_dir = request.log_dir();
        let mut lines = vec![
            "#!/bin/bash -l".to_string(),
            String::new(),
            format!("#SBATCH -A {}", self.account),
            format!("#SBATCH -J {}", request.job_name),
            format!("#SBATCH -p {}", self.config.partition),
            "#SBATCH -N 1".to_string(),
            format!("#SBATCH -n {}", self.config.cores),
            format!("#SBATCH -t {}", self.config.time),
            format!("#SBATCH -o {}", log_dir.join(format!("{}.out", request.job_name))),
            format!("#SBATCH -e {}", log_dir.join(format!("{}.err", request.job_name))),
            format!("#SBATCH -D {}", request.working_dir),
        ];
        if let Some(mail_user) = &self.config.mail_user {
            lines.push(format!("#SBATCH --mail-user {mail_user}"));
        }
        lines.push("#SBATCH --mail-type NONE".to_string());
        lines.extend(
            self.config
                .extra_args
                .iter()
                .map(|arg| format!("#SBATCH {arg}")),
        );
        let exit_code = shell_quote(request.exit_code_path.as_str());
        lines.push(String::new());
        lines.push(format!("echo \"\" > {exit_code}"));
        lines.push(request.command.clone());
        lines.push(format!("echo \"$?\" > {exit_code}"));
        lines.push(String::new());
        lines.join("\n")
    }
}

impl ProcessConnector for SlurmConnector {
    fn executor(&self) -> ExecutorKind {
        ExecutorKind::Slurm
    }

    fn execute(&self, request: &LaunchRequest) -> Result<String, ConductorError> {
        prepare_dirs(request)?;
        let script_path = self.script_path(request);
        fs_util::write_text(&script_path, &self.sbatch_script(request))?;
        let stdout = run_tool(&self.sbatch, &[script_path.as_str()])?;
        let job_id = parse_submitted_job_id(&stdout).ok_or_else(|| {
            ConductorError::ProcessLaunch(format!("no job id in sbatch output {:?}", stdout.trim()))
        })?;
        info!(job = %request.job_name, slurm_job_id = %job_id, "submitted slurm job");
        Ok(job_id)
    }

    fn poll(
        &self,
        process_id: &str,
        exit_code_path: &Utf8Path,
    ) -> Result<Option<i32>, ConductorError> {
        let output = run_tool(&self.sacct, &["-n", "-j", process_id, "-o", "STATE"])?;
        match parse_sacct_state(process_id, &output)? {
            SchedulerState::Active(state) => {
                debug!(slurm_job_id = process_id, state = %state, "job still active");
                Ok(None)
            }
            SchedulerState::Completed => Ok(Some(read_exit_code(exit_code_path).unwrap_or(0))),
            SchedulerState::Failed(state) => {
                debug!(slurm_job_id = process_id, state = %state, "job ended abnormally");
                Ok(Some(
                    read_exit_code(exit_code_path)
                        .filter(|code| *code != 0)
                        .unwrap_or(1),
                ))
            }
        }
    }

    fn cancel(&self, process_id: &str) -> Result<(), ConductorError> {
        run_tool(&self.scancel, &[process_id]).map(|_| ())
    }
}
