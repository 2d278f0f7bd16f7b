use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ConductorError {
    #[error("no config file found (looked at {0})")]
    #[diagnostic(help("pass --config or set NGI_CONFIG"))]
    MissingConfig(Utf8PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("missing required config key: {0}")]
    MissingConfigKey(String),

    #[error("Charon request failed: {0}")]
    CharonHttp(String),

    #[error("Charon has no record for {0}")]
    CharonNotFound(String),

    #[error("Charon record already exists for {0}")]
    CharonConflict(String),

    #[error("Charon does not allow this method on {0}")]
    CharonMethodNotAllowed(String),

    #[error("Charon returned status {status}: {message}")]
    CharonStatus { status: u16, message: String },

    #[error("Charon sent an unreadable response for {unit}: {message}")]
    CharonDecode { unit: String, message: String },

    #[error("Charon record for {unit} has no field {field}")]
    CharonMissingField { unit: String, field: String },

    #[error("tracking store error: {0}")]
    TrackingStore(String),

    #[error("no tracking record for {0}")]
    TrackingRecordMissing(String),

    #[error("DB incongruency for {unit}: Charon reports {status} but no local process is tracked")]
    #[diagnostic(help("check whether the analysis runs elsewhere, then reset the status in Charon"))]
    Incongruency { unit: String, status: String },

    #[error("failed to launch process: {0}")]
    ProcessLaunch(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("scheduler returned no state for job {0}")]
    SchedulerEmptyResponse(String),

    #[error("scheduler returned unrecognized state {state:?} for job {job_id}")]
    SchedulerUnrecognizedState { job_id: String, state: String },

    #[error("failed to parse metrics: {0}")]
    MetricParse(String),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("workflow {0} is not implemented")]
    WorkflowNotImplemented(String),

    #[error("sample {0} has no sequencing runs eligible for analysis")]
    SampleNotAnalyzable(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl ConductorError {
    /// Errors that make the rest of the invocation pointless.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            ConductorError::MissingConfig(_)
                | ConductorError::ConfigRead(_)
                | ConductorError::ConfigParse(_)
                | ConductorError::MissingConfigKey(_)
                | ConductorError::CharonHttp(_)
                | ConductorError::TrackingStore(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ConductorError::CharonConflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ConductorError::CharonNotFound(_))
    }
}
