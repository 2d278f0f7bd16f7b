use std::collections::BTreeMap;
use std::process::ExitCode;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ngi_conductor::charon::{CharonHttpClient, StatusConnector};
use ngi_conductor::config::{ConfigLoader, ExecutorKind, ResolvedConfig};
use ngi_conductor::domain::Project;
use ngi_conductor::error::ConductorError;
use ngi_conductor::flowcell::parse_flowcell;
use ngi_conductor::launcher::{LaunchOptions, Launcher};
use ngi_conductor::notify::{Notifier, notifier_from_config};
use ngi_conductor::organizer::{
    OrganizeFilter, Organizer, RegistrationOptions, project_from_filesystem,
};
use ngi_conductor::output::{OutputMode, TextOutput, emit};
use ngi_conductor::process::{LocalProcessConnector, ProcessConnector, SlurmConnector};
use ngi_conductor::prompt::{confirm, restart_question};
use ngi_conductor::status::RestartPolicy;
use ngi_conductor::sweep::StatusSweep;
use ngi_conductor::tracking::TrackingStore;
use ngi_conductor::workflow::WorkflowRegistry;

#[derive(Parser)]
#[command(name = "ngi-conductor")]
#[command(about = "Organize sequencing data, launch analyses and keep Charon in sync")]
#[command(version, author)]
struct Cli {
    /// Config file (default: $NGI_CONFIG or ~/.ngipipeline/ngi_config.json)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log warnings only and do not mail operators
    #[arg(long, global = true)]
    quiet: bool,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Sort demultiplexed data into the analysis tree")]
    Organize(OrganizeArgs),
    #[command(about = "Launch best-practice analysis")]
    Analyze(AnalyzeArgs),
    #[command(about = "Launch fastq QC")]
    Qc(QcArgs),
    #[command(about = "Poll tracked processes and report results to Charon")]
    UpdateStatus,
}

#[derive(Args)]
struct OrganizeArgs {
    #[command(subcommand)]
    command: OrganizeCommand,
}

#[derive(Subcommand)]
enum OrganizeCommand {
    #[command(about = "Organize one or more demultiplexed flowcell directories")]
    Flowcell(FlowcellArgs),
}

#[derive(Args)]
struct FlowcellArgs {
    #[arg(required = true)]
    dirs: Vec<Utf8PathBuf>,

    #[arg(short = 'p', long = "project")]
    projects: Vec<String>,

    #[arg(short = 's', long = "sample")]
    samples: Vec<String>,

    /// Libprep to use when Charon has none for a seqrun
    #[arg(short = 'l', long)]
    fallback_libprep: Option<String>,

    #[arg(short = 'w', long)]
    sequencing_facility: Option<String>,

    #[arg(short = 'b', long)]
    best_practice_analysis: Option<String>,

    #[arg(long)]
    pipeline: Option<String>,

    #[arg(long)]
    reference: Option<String>,

    /// Overwrite existing Charon records
    #[arg(short = 'f', long)]
    force: bool,
}

#[derive(Args)]
struct AnalyzeArgs {
    #[command(subcommand)]
    command: AnalyzeCommand,
}

#[derive(Subcommand)]
enum AnalyzeCommand {
    #[command(about = "Analyze organized project directories")]
    Project(AnalyzeProjectArgs),
}

#[derive(Args)]
struct AnalyzeProjectArgs {
    #[arg(required = true)]
    dirs: Vec<Utf8PathBuf>,

    #[arg(short = 's', long = "sample")]
    samples: Vec<String>,

    /// One job for all samples of a project
    #[arg(long)]
    batch_analysis: bool,

    #[arg(long)]
    no_qc: bool,

    #[arg(short = 'f', long)]
    restart_failed: bool,

    #[arg(short = 'd', long)]
    restart_done: bool,

    #[arg(short = 'r', long)]
    restart_running: bool,

    #[arg(short = 'a', long)]
    restart_all: bool,
}

#[derive(Args)]
struct QcArgs {
    #[command(subcommand)]
    command: QcCommand,
}

#[derive(Subcommand)]
enum QcCommand {
    #[command(about = "Run fastq QC on organized project directories")]
    Project(QcProjectArgs),
}

#[derive(Args)]
struct QcProjectArgs {
    #[arg(required = true)]
    dirs: Vec<Utf8PathBuf>,

    #[arg(short = 's', long = "sample")]
    samples: Vec<String>,

    #[arg(short = 'f', long)]
    force_rerun: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<ConductorError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ConductorError) -> u8 {
    match error {
        ConductorError::MissingConfig(_)
        | ConductorError::ConfigRead(_)
        | ConductorError::ConfigParse(_)
        | ConductorError::MissingConfigKey(_) => 2,
        ConductorError::CharonHttp(_)
        | ConductorError::CharonStatus { .. }
        | ConductorError::CharonDecode { .. }
        | ConductorError::CharonMethodNotAllowed(_)
        | ConductorError::MissingTool(_)
        | ConductorError::SchedulerEmptyResponse(_)
        | ConductorError::SchedulerUnrecognizedState { .. } => 3,
        _ => 1,
    }
}

/// Everything a command needs, built once from the resolved config.
struct Context {
    config: ResolvedConfig,
    charon: StatusConnector<CharonHttpClient>,
    tracking: TrackingStore,
    workflows: WorkflowRegistry,
    notifier: Box<dyn Notifier>,
    local: LocalProcessConnector,
    slurm: Option<SlurmConnector>,
    output_mode: OutputMode,
}

impl Context {
    fn new(cli: &Cli) -> Result<Self, ConductorError> {
        let config = ConfigLoader::resolve(cli.config.as_deref())?;
        let charon = StatusConnector::new(CharonHttpClient::new(&config.charon)?);
        let tracking = TrackingStore::new(config.tracking_db_path()?);
        let slurm = match config.executor {
            ExecutorKind::Slurm => Some(SlurmConnector::new(config.slurm.clone())?),
            ExecutorKind::Local => None,
        };
        Ok(Self {
            charon,
            tracking,
            workflows: WorkflowRegistry::from_config(&config),
            notifier: notifier_from_config(&config.mail, cli.quiet),
            local: LocalProcessConnector::new(),
            slurm,
            output_mode: OutputMode::from_flag(cli.non_interactive),
            config,
        })
    }

    fn executor(&self) -> &dyn ProcessConnector {
        match &self.slurm {
            Some(slurm) => slurm as &dyn ProcessConnector,
            None => &self.local,
        }
    }

    fn launcher(&self) -> Launcher<'_, CharonHttpClient> {
        Launcher::new(
            &self.charon,
            &self.tracking,
            self.executor(),
            &self.workflows,
            self.notifier.as_ref(),
        )
    }

    /// Relative project directories live under `<top_dir>/DATA`.
    fn project_dir(&self, dir: &Utf8Path) -> Result<Utf8PathBuf, ConductorError> {
        if dir.is_absolute() || dir.as_std_path().exists() {
            return Ok(dir.to_path_buf());
        }
        Ok(self.config.top_dir()?.join("DATA").join(dir))
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let ctx = Context::new(&cli)?;
    match &cli.command {
        Commands::Organize(args) => match &args.command {
            OrganizeCommand::Flowcell(args) => run_organize(&ctx, args),
        },
        Commands::Analyze(args) => match &args.command {
            AnalyzeCommand::Project(args) => run_analyze(&ctx, args),
        },
        Commands::Qc(args) => match &args.command {
            QcCommand::Project(args) => run_qc(&ctx, args),
        },
        Commands::UpdateStatus => run_update_status(&ctx),
    }
}

fn run_organize(ctx: &Context, args: &FlowcellArgs) -> miette::Result<()> {
    if args.force
        && !confirm(
            "Overwrite existing Charon records for these projects?",
            ctx.output_mode,
        )
        .into_diagnostic()?
    {
        return Ok(());
    }

    let top_dir = ctx.config.top_dir()?;
    let organizer = Organizer::new(&ctx.charon, ctx.notifier.as_ref(), top_dir)
        .with_project_id_fallback(ctx.config.organize.project_id_fallback);
    let filter = OrganizeFilter {
        projects: args.projects.clone(),
        samples: args.samples.clone(),
        fallback_libprep: args.fallback_libprep.clone(),
    };

    let mut dirs = args.dirs.clone();
    dirs.sort();
    dirs.dedup();
    let mut projects = BTreeMap::new();
    for dir in &dirs {
        let dir = if dir.is_absolute() {
            dir.clone()
        } else {
            top_dir.join(dir)
        };
        match parse_flowcell(&dir) {
            Ok(flowcell) => organizer.organize_flowcell(&flowcell, &filter, &mut projects)?,
            Err(err) => error!(flowcell = %dir, error = %err, "could not parse flowcell directory"),
        }
    }
    if projects.is_empty() {
        return Err(miette::Report::msg(format!(
            "no projects found to process in {}",
            dirs.iter().map(|d| d.as_str()).collect::<Vec<_>>().join(", ")
        )));
    }

    let mut options = RegistrationOptions::from_defaults(&ctx.config.organize);
    options.force_overwrite = args.force;
    if let Some(value) = &args.best_practice_analysis {
        options.best_practice_analysis = value.clone();
    }
    if let Some(value) = &args.sequencing_facility {
        options.sequencing_facility = value.clone();
    }
    if let Some(value) = &args.pipeline {
        options.pipeline = value.clone();
    }
    if let Some(value) = &args.reference {
        options.reference = value.clone();
    }

    let launcher = ctx.launcher();
    for project in projects.values_mut() {
        project.best_practice_analysis = Some(options.best_practice_analysis.clone());
        project.sequencing_facility = Some(options.sequencing_facility.clone());
        let registration = organizer.register_project(project, &options)?;
        emit(ctx.output_mode, &registration, TextOutput::registration_summary).into_diagnostic()?;
        analyze(ctx, &launcher, project, &LaunchOptions::default())?;
    }
    Ok(())
}

fn run_analyze(ctx: &Context, args: &AnalyzeProjectArgs) -> miette::Result<()> {
    let restart = if args.restart_all {
        RestartPolicy::all()
    } else {
        RestartPolicy {
            restart_failed: args.restart_failed,
            restart_finished: args.restart_done,
            restart_running: args.restart_running,
        }
    };
    if let Some(question) = restart_question(
        restart.restart_failed,
        restart.restart_finished,
        restart.restart_running,
    ) {
        if !confirm(&question, ctx.output_mode).into_diagnostic()? {
            return Ok(());
        }
    }
    let options = LaunchOptions {
        restart,
        batch: args.batch_analysis,
        start_failed_libpreps: false,
    };

    let launcher = ctx.launcher();
    for dir in &args.dirs {
        let project = project_from_filesystem(&ctx.project_dir(dir)?, &args.samples)?;
        analyze(ctx, &launcher, &project, &options)?;
        if !args.no_qc {
            let report = launcher.qc_project(&project, false)?;
            emit(ctx.output_mode, &report, TextOutput::launch_summary).into_diagnostic()?;
        }
    }
    Ok(())
}

/// Runs one project's analysis; failures that only concern the project are
/// logged so the remaining projects still run.
fn analyze(
    ctx: &Context,
    launcher: &Launcher<'_, CharonHttpClient>,
    project: &Project,
    options: &LaunchOptions,
) -> miette::Result<()> {
    match launcher.analyze_project(project, options) {
        Ok(report) => emit(ctx.output_mode, &report, TextOutput::launch_summary).into_diagnostic(),
        Err(err) if err.is_systemic() => Err(err.into()),
        Err(err) => {
            error!(project = %project.id, error = %err, "skipping project");
            Ok(())
        }
    }
}

fn run_qc(ctx: &Context, args: &QcProjectArgs) -> miette::Result<()> {
    if args.force_rerun
        && !confirm("Rerun QC even where results exist?", ctx.output_mode).into_diagnostic()?
    {
        return Ok(());
    }
    let launcher = ctx.launcher();
    for dir in &args.dirs {
        let project = project_from_filesystem(&ctx.project_dir(dir)?, &args.samples)?;
        let report = launcher.qc_project(&project, args.force_rerun)?;
        emit(ctx.output_mode, &report, TextOutput::launch_summary).into_diagnostic()?;
    }
    Ok(())
}

fn run_update_status(ctx: &Context) -> miette::Result<()> {
    let mut sweep = StatusSweep::new(
        &ctx.charon,
        &ctx.tracking,
        &ctx.workflows,
        ctx.notifier.as_ref(),
    )
    .with_connector(&ctx.local);
    if let Some(slurm) = &ctx.slurm {
        sweep = sweep.with_connector(slurm);
    }
    let report = sweep.run()?;
    info!(removed = report.removed, "tracking store updated");
    emit(ctx.output_mode, &report, TextOutput::sweep_summary).into_diagnostic()?;
    Ok(())
}
