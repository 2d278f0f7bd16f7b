use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use crate::domain::{SeqrunId, is_fastq};
use crate::error::ConductorError;
use crate::fs_util;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowcellSample {
    pub name: String,
    pub dir: Utf8PathBuf,
    pub fastq_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowcellProject {
    pub name: String,
    pub dir: Utf8PathBuf,
    pub samples: Vec<FlowcellSample>,
}

/// Projects and samples found in one demultiplexed run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flowcell {
    pub dir: Utf8PathBuf,
    pub seqrun: SeqrunId,
    pub projects: Vec<FlowcellProject>,
}

impl Flowcell {
    pub fn project(&self, name: &str) -> Option<&FlowcellProject> {
        self.projects.iter().find(|project| project.name == name)
    }
}

/// Walks `<run>/Demultiplexing/<Project>/<Sample>/*.fastq*`, falling back to
/// the older `Unaligned*` layout.
pub fn parse_flowcell(dir: &Utf8Path) -> Result<Flowcell, ConductorError> {
    if !dir.as_std_path().is_dir() {
        return Err(ConductorError::Filesystem(format!(
            "flowcell directory {dir} does not exist"
        )));
    }
    let seqrun: SeqrunId = fs_util::file_name(dir).parse()?;
    info!(flowcell = %dir, "parsing flowcell directory");

    let mut projects = Vec::new();
    for data_dir in data_dirs(dir)? {
        for project_dir in fs_util::subdirs(&data_dir)? {
            let name = project_name(fs_util::file_name(&project_dir));
            let mut samples = Vec::new();
            for sample_dir in fs_util::subdirs(&project_dir)? {
                let sample_name = fs_util::file_name(&sample_dir);
                let sample_name = sample_name.strip_prefix("Sample_").unwrap_or(sample_name);
                let fastq_files = fastq_files_in(&sample_dir)?;
                if fastq_files.is_empty() {
                    warn!(sample = sample_name, dir = %sample_dir, "no fastq files in sample directory");
                    continue;
                }
                samples.push(FlowcellSample {
                    name: sample_name.to_string(),
                    dir: sample_dir.clone(),
                    fastq_files,
                });
            }
            if samples.is_empty() {
                warn!(project = %name, flowcell = %dir, "no samples found for project");
                continue;
            }
            projects.push(FlowcellProject {
                name,
                dir: project_dir,
                samples,
            });
        }
    }

    if projects.is_empty() {
        return Err(ConductorError::Filesystem(format!(
            "no projects with samples in flowcell directory {dir}"
        )));
    }
    Ok(Flowcell {
        dir: dir.to_path_buf(),
        seqrun,
        projects,
    })
}

fn data_dirs(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, ConductorError> {
    let demultiplexing = dir.join("Demultiplexing");
    if demultiplexing.as_std_path().is_dir() {
        return Ok(vec![demultiplexing]);
    }
    Ok(fs_util::subdirs(dir)?
        .into_iter()
        .filter(|path| fs_util::file_name(path).starts_with("Unaligned"))
        .collect())
}

/// `Project_A__Name_20_01` -> `A.Name_20_01`
fn project_name(dir_name: &str) -> String {
    dir_name
        .strip_prefix("Project_")
        .unwrap_or(dir_name)
        .replace("__", ".")
}

fn fastq_files_in(dir: &Utf8Path) -> Result<Vec<String>, ConductorError> {
    let entries = std::fs::read_dir(dir.as_std_path())
        .map_err(|err| ConductorError::Filesystem(format!("read {dir}: {err}")))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| ConductorError::Filesystem(err.to_string()))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if entry.path().is_file() && is_fastq(&name) {
            files.push(name);
        }
    }
    files.sort();
    Ok(files)
}
