use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::config::{QcConfig, ResolvedConfig, SarekConfig};
use crate::domain::{FastqName, Project, Sample, SeqrunId};
use crate::error::ConductorError;
use crate::fs_util;
use crate::metrics::{self, AnalysisMetrics};
use crate::process::shell_quote;

/// Where one launch keeps its manifest, exit code, scratch and results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisLayout {
    pub analysis_dir: Utf8PathBuf,
    pub manifest_path: Utf8PathBuf,
    pub exit_code_path: Utf8PathBuf,
    pub work_dir: Utf8PathBuf,
    pub results_dir: Utf8PathBuf,
    pub job_name: String,
}

impl AnalysisLayout {
    fn in_dir(analysis_dir: Utf8PathBuf, job_name: String) -> Self {
        Self {
            manifest_path: analysis_dir.join(format!("{job_name}.tsv")),
            exit_code_path: analysis_dir.join(format!("{job_name}.exit_code")),
            work_dir: analysis_dir.join("work"),
            results_dir: analysis_dir.join("results"),
            analysis_dir,
            job_name,
        }
    }

    /// `ANALYSIS/<project>/<sample>/<workflow>/`
    pub fn for_sample(project: &Project, sample: &str, workflow: &str) -> Self {
        Self::in_dir(
            project.analysis_dir().join(sample).join(workflow),
            format!("{}-{sample}-{workflow}", project.id),
        )
    }

    /// `ANALYSIS/<project>/<workflow>/`, shared by every sample of a batch.
    pub fn for_project(project: &Project, workflow: &str) -> Self {
        Self::in_dir(
            project.analysis_dir().join(workflow),
            format!("{}-{workflow}", project.id),
        )
    }
}

/// The samples, trimmed to their eligible libpreps and seqruns, that one
/// launch covers.
#[derive(Debug, Clone)]
pub struct AnalysisTarget<'a> {
    pub project: &'a Project,
    pub samples: Vec<Sample>,
    pub layout: AnalysisLayout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingStep {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessingStep {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn flag(self, flag: &str, value: impl Into<String>) -> Self {
        self.arg(flag).arg(value)
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub trait WorkflowAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn engine(&self) -> &str;

    fn layout_for_sample(&self, project: &Project, sample: &str) -> AnalysisLayout {
        AnalysisLayout::for_sample(project, sample, self.name())
    }

    fn layout_for_project(&self, project: &Project) -> AnalysisLayout {
        AnalysisLayout::for_project(project, self.name())
    }

    fn processing_steps(
        &self,
        target: &AnalysisTarget<'_>,
    ) -> Result<Vec<ProcessingStep>, ConductorError>;

    fn command_line(&self, target: &AnalysisTarget<'_>) -> Result<String, ConductorError> {
        let steps = self.processing_steps(target)?;
        Ok(steps
            .iter()
            .map(ProcessingStep::command_line)
            .collect::<Vec<_>>()
            .join(" && "))
    }

    /// Rows of the tab-separated input sheet, empty when the workflow takes none.
    fn generate_work_manifest(
        &self,
        target: &AnalysisTarget<'_>,
    ) -> Result<Vec<Vec<String>>, ConductorError>;

    /// `None` when the workflow reports nothing beyond its exit status.
    fn collect_metrics(
        &self,
        results_dir: &Utf8Path,
    ) -> Result<Option<AnalysisMetrics>, ConductorError>;

    fn write_work_manifest(&self, target: &AnalysisTarget<'_>) -> Result<(), ConductorError> {
        let rows = self.generate_work_manifest(target)?;
        if rows.is_empty() {
            return Ok(());
        }
        let mut content = rows
            .iter()
            .map(|row| row.join("\t"))
            .collect::<Vec<_>>()
            .join("\n");
        content.push('\n');
        fs_util::write_text(&target.layout.manifest_path, &content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SarekMode {
    Germline,
    Somatic,
}

#[derive(Debug, Clone)]
pub struct SarekWorkflow {
    mode: SarekMode,
    config: SarekConfig,
}

impl SarekWorkflow {
    pub fn germline(config: SarekConfig) -> Self {
        Self {
            mode: SarekMode::Germline,
            config,
        }
    }

    pub fn somatic(config: SarekConfig) -> Self {
        Self {
            mode: SarekMode::Somatic,
            config,
        }
    }

    fn check_mode(&self) -> Result<(), ConductorError> {
        match self.mode {
            SarekMode::Germline => Ok(()),
            SarekMode::Somatic => Err(ConductorError::WorkflowNotImplemented(
                self.name().to_string(),
            )),
        }
    }
}

impl WorkflowAdapter for SarekWorkflow {
    fn name(&self) -> &str {
        match self.mode {
            SarekMode::Germline => "sarek_germline",
            SarekMode::Somatic => "sarek_somatic",
        }
    }

    fn engine(&self) -> &str {
        "sarek"
    }

    fn processing_steps(
        &self,
        target: &AnalysisTarget<'_>,
    ) -> Result<Vec<ProcessingStep>, ConductorError> {
        self.check_mode()?;
        let layout = &target.layout;
        let step = ProcessingStep::new(&self.config.nextflow)
            .arg("run")
            .arg(&self.config.sarek_path)
            .flag("-profile", &self.config.profile)
            .flag("-work-dir", layout.work_dir.as_str())
            .flag("--input", layout.manifest_path.as_str())
            .flag("--outdir", layout.results_dir.as_str())
            .flag("--genome", &self.config.genome)
            .args(self.config.extra_args.iter().cloned());
        Ok(vec![step])
    }

    fn generate_work_manifest(
        &self,
        target: &AnalysisTarget<'_>,
    ) -> Result<Vec<Vec<String>>, ConductorError> {
        self.check_mode()?;
        let mut rows = Vec::new();
        for sample in &target.samples {
            for (libprep, seqrun) in sample.seqrun_pairs() {
                let flowcell = seqrun
                    .id
                    .parse::<SeqrunId>()
                    .map(|id| id.flowcell().to_string())
                    .unwrap_or_else(|_| seqrun.id.clone());
                let paths = target.project.fastq_paths(&sample.id, &libprep.id, seqrun);
                for pair in pair_reads(&paths) {
                    rows.push(vec![
                        sample.id.clone(),
                        "ZZ".to_string(),
                        "0".to_string(),
                        sample.id.clone(),
                        format!("{flowcell}.{}", pair.lane),
                        pair.read1.to_string(),
                        pair.read2.to_string(),
                    ]);
                }
            }
        }
        if rows.is_empty() {
            return Err(ConductorError::SampleNotAnalyzable(
                target
                    .samples
                    .iter()
                    .map(|s| s.id.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            ));
        }
        Ok(rows)
    }

    fn collect_metrics(
        &self,
        results_dir: &Utf8Path,
    ) -> Result<Option<AnalysisMetrics>, ConductorError> {
        metrics::collect_alignment_metrics(results_dir).map(Some)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPair {
    pub lane: u32,
    pub read1: Utf8PathBuf,
    pub read2: Utf8PathBuf,
}

/// Matches R1/R2 files by sample number and lane; index reads are dropped.
pub fn pair_reads(paths: &[Utf8PathBuf]) -> Vec<ReadPair> {
    let mut by_lane: BTreeMap<(u32, u32), (Option<&Utf8PathBuf>, Option<&Utf8PathBuf>)> =
        BTreeMap::new();
    for path in paths {
        let name = match fs_util::file_name(path).parse::<FastqName>() {
            Ok(name) => name,
            Err(_) => {
                warn!(path = %path, "fastq name not recognized, skipping");
                continue;
            }
        };
        if name.is_index {
            continue;
        }
        let slot = by_lane.entry((name.sample_number, name.lane)).or_default();
        match name.read {
            1 => slot.0 = Some(path),
            2 => slot.1 = Some(path),
            _ => {}
        }
    }
    by_lane
        .into_iter()
        .filter_map(|((_, lane), pair)| match pair {
            (Some(read1), Some(read2)) => Some(ReadPair {
                lane,
                read1: read1.clone(),
                read2: read2.clone(),
            }),
            (read1, read2) => {
                warn!(lane, ?read1, ?read2, "unpaired fastq files, skipping");
                None
            }
        })
        .collect()
}

/// FastQC and FastQ Screen over every fastq of the sample.
#[derive(Debug, Clone)]
pub struct FastqQc {
    config: QcConfig,
}

impl FastqQc {
    pub fn new(config: QcConfig) -> Self {
        Self { config }
    }
}

impl WorkflowAdapter for FastqQc {
    fn name(&self) -> &str {
        "qc"
    }

    fn engine(&self) -> &str {
        "qc_ngi"
    }

    fn layout_for_sample(&self, project: &Project, sample: &str) -> AnalysisLayout {
        AnalysisLayout::in_dir(
            project.analysis_dir().join("qc_ngi").join(sample),
            format!("{}-{sample}-qc", project.id),
        )
    }

    fn processing_steps(
        &self,
        target: &AnalysisTarget<'_>,
    ) -> Result<Vec<ProcessingStep>, ConductorError> {
        let mut fastq_files = Vec::new();
        for sample in &target.samples {
            for (libprep, seqrun) in sample.seqrun_pairs() {
                fastq_files.extend(
                    target
                        .project
                        .fastq_paths(&sample.id, &libprep.id, seqrun)
                        .into_iter()
                        .map(String::from),
                );
            }
        }
        if fastq_files.is_empty() {
            return Err(ConductorError::SampleNotAnalyzable(
                target.layout.job_name.clone(),
            ));
        }

        let fastqc_dir = target.layout.results_dir.join("fastqc");
        let screen_dir = target.layout.results_dir.join("fastq_screen");
        let threads = self.config.threads.to_string();
        let prepare = ProcessingStep::new("mkdir")
            .arg("-p")
            .arg(fastqc_dir.as_str())
            .arg(screen_dir.as_str());
        let run_fastqc = ProcessingStep::new(&self.config.fastqc)
            .flag("--outdir", fastqc_dir.as_str())
            .flag("--threads", threads.as_str())
            .args(fastq_files.iter().cloned());
        let mut screen = ProcessingStep::new(&self.config.fastq_screen)
            .flag("--outdir", screen_dir.as_str())
            .flag("--threads", threads.as_str());
        if let Some(conf) = &self.config.fastq_screen_config {
            screen = screen.flag("--conf", conf.as_str());
        }
        let screen = screen.args(fastq_files);
        Ok(vec![prepare, run_fastqc, screen])
    }

    fn generate_work_manifest(
        &self,
        _target: &AnalysisTarget<'_>,
    ) -> Result<Vec<Vec<String>>, ConductorError> {
        Ok(Vec::new())
    }

    fn collect_metrics(
        &self,
        _results_dir: &Utf8Path,
    ) -> Result<Option<AnalysisMetrics>, ConductorError> {
        Ok(None)
    }
}

/// Workflow adapters by identifier, plus the best-practice labels that pick them.
pub struct WorkflowRegistry {
    adapters: BTreeMap<String, Box<dyn WorkflowAdapter>>,
    best_practice: BTreeMap<String, String>,
}

impl WorkflowRegistry {
    pub fn new(best_practice: BTreeMap<String, String>) -> Self {
        Self {
            adapters: BTreeMap::new(),
            best_practice,
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        let mut registry = Self::new(config.best_practice_workflows.clone());
        registry.register(Box::new(SarekWorkflow::germline(config.sarek.clone())));
        registry.register(Box::new(SarekWorkflow::somatic(config.sarek.clone())));
        registry.register(Box::new(FastqQc::new(config.qc.clone())));
        registry
    }

    pub fn register(&mut self, adapter: Box<dyn WorkflowAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, workflow: &str) -> Result<&dyn WorkflowAdapter, ConductorError> {
        self.adapters
            .get(workflow)
            .map(|adapter| adapter.as_ref())
            .ok_or_else(|| ConductorError::UnknownWorkflow(workflow.to_string()))
    }

    pub fn for_best_practice(&self, label: &str) -> Result<&dyn WorkflowAdapter, ConductorError> {
        let workflow = self
            .best_practice
            .get(&label.trim().to_lowercase())
            .ok_or_else(|| ConductorError::UnknownWorkflow(label.to_string()))?;
        self.get(workflow)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_best_practice_workflows;
    use crate::domain::{LibraryPrep, SequencingRun};

    fn sarek_config() -> SarekConfig {
        SarekConfig {
            nextflow: "nextflow".to_string(),
            sarek_path: "/opt/sarek/main.nf".to_string(),
            profile: "uppmax".to_string(),
            genome: "GRCh38".to_string(),
            extra_args: vec!["-resume".to_string()],
        }
    }

    fn project() -> Project {
        let mut project = Project::new("P1", "A.Test_20_01", Utf8PathBuf::from("/top"));
        let seqrun = project
            .add_sample(Sample::new("P1_101"))
            .add_libprep(LibraryPrep::new("A"))
            .add_seqrun(SequencingRun::new("190101_ST-E00201_0001_AHXXXXXX"));
        seqrun.add_fastq_file("P1_101_S1_L001_R1_001.fastq.gz");
        seqrun.add_fastq_file("P1_101_S1_L001_R2_001.fastq.gz");
        seqrun.add_fastq_file("P1_101_S1_L001_I1_001.fastq.gz");
        project
    }

    #[test]
    fn layouts_follow_naming_scheme() {
        let project = project();
        let layout = AnalysisLayout::for_sample(&project, "P1_101", "sarek_germline");
        assert_eq!(
            layout.exit_code_path,
            "/top/ANALYSIS/P1/P1_101/sarek_germline/P1-P1_101-sarek_germline.exit_code"
        );
        assert_eq!(layout.work_dir, "/top/ANALYSIS/P1/P1_101/sarek_germline/work");
        let batch = AnalysisLayout::for_project(&project, "sarek_germline");
        assert_eq!(batch.manifest_path, "/top/ANALYSIS/P1/sarek_germline/P1-sarek_germline.tsv");
    }

    #[test]
    fn sarek_manifest_pairs_reads() {
        let project = project();
        let sarek = SarekWorkflow::germline(sarek_config());
        let target = AnalysisTarget {
            project: &project,
            samples: project.samples().cloned().collect(),
            layout: sarek.layout_for_sample(&project, "P1_101"),
        };
        let rows = sarek.generate_work_manifest(&target).unwrap();
        let dir = "/top/DATA/P1/P1_101/A/190101_ST-E00201_0001_AHXXXXXX";
        assert_eq!(
            rows,
            vec![vec![
                "P1_101".to_string(),
                "ZZ".to_string(),
                "0".to_string(),
                "P1_101".to_string(),
                "HXXXXXX.1".to_string(),
                format!("{dir}/P1_101_S1_L001_R1_001.fastq.gz"),
                format!("{dir}/P1_101_S1_L001_R2_001.fastq.gz"),
            ]]
        );

        let command = sarek.command_line(&target).unwrap();
        assert!(command.starts_with("nextflow run /opt/sarek/main.nf -profile uppmax"));
        assert!(command.contains("--input /top/ANALYSIS/P1/P1_101/sarek_germline/P1-P1_101-sarek_germline.tsv"));
        assert!(command.ends_with("--genome GRCh38 -resume"));
    }

    #[test]
    fn somatic_is_declared_but_refuses_to_run() {
        let project = project();
        let sarek = SarekWorkflow::somatic(sarek_config());
        let target = AnalysisTarget {
            project: &project,
            samples: project.samples().cloned().collect(),
            layout: sarek.layout_for_project(&project),
        };
        assert!(matches!(
            sarek.command_line(&target),
            Err(ConductorError::WorkflowNotImplemented(_))
        ));
    }

    #[test]
    fn registry_resolves_best_practice_labels() {
        let mut registry = WorkflowRegistry::new(default_best_practice_workflows());
        registry.register(Box::new(SarekWorkflow::germline(sarek_config())));
        assert_eq!(
            registry.for_best_practice("WGS_germline").unwrap().name(),
            "sarek_germline"
        );
        assert!(matches!(
            registry.for_best_practice("rna_seq"),
            Err(ConductorError::UnknownWorkflow(_))
        ));
        assert!(matches!(
            registry.for_best_practice("qc"),
            Err(ConductorError::UnknownWorkflow(_))
        ));
    }
}
