use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConductorError;

static FASTQ_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.*\.(fastq|fq)(\.gz|\.gzip|\.bz2)?$").expect("valid fastq pattern")
});

static ILLUMINA_FASTQ_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<sample>.+)_S(?P<number>\d+)_L(?P<lane>\d{3})_(?P<kind>[RI])(?P<read>\d)_\d{3}\.(fastq|fq)(\.gz|\.gzip|\.bz2)?$",
    )
    .expect("valid illumina fastq pattern")
});

static SEQRUN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<date>\d{6})_(?P<instrument>[A-Za-z0-9-]+)_(?P<run>\d+)_(?P<position>[AB]?)(?P<flowcell>[A-Za-z0-9-]+)$")
        .expect("valid seqrun pattern")
});

pub fn is_fastq(file_name: &str) -> bool {
    FASTQ_RE.is_match(file_name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitLevel {
    Project,
    Sample,
    Libprep,
    Seqrun,
}

impl UnitLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitLevel::Project => "project",
            UnitLevel::Sample => "sample",
            UnitLevel::Libprep => "libprep",
            UnitLevel::Seqrun => "seqrun",
        }
    }
}

impl fmt::Display for UnitLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one work unit. Each level is a separate field, so ids that
/// contain `_` or `/` never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "lowercase")]
pub enum UnitKey {
    Project {
        project: String,
    },
    Sample {
        project: String,
        sample: String,
    },
    Libprep {
        project: String,
        sample: String,
        libprep: String,
    },
    Seqrun {
        project: String,
        sample: String,
        libprep: String,
        seqrun: String,
    },
}

impl UnitKey {
    pub fn project(project: impl Into<String>) -> Self {
        UnitKey::Project {
            project: project.into(),
        }
    }

    pub fn sample(project: impl Into<String>, sample: impl Into<String>) -> Self {
        UnitKey::Sample {
            project: project.into(),
            sample: sample.into(),
        }
    }

    pub fn libprep(
        project: impl Into<String>,
        sample: impl Into<String>,
        libprep: impl Into<String>,
    ) -> Self {
        UnitKey::Libprep {
            project: project.into(),
            sample: sample.into(),
            libprep: libprep.into(),
        }
    }

    pub fn seqrun(
        project: impl Into<String>,
        sample: impl Into<String>,
        libprep: impl Into<String>,
        seqrun: impl Into<String>,
    ) -> Self {
        UnitKey::Seqrun {
            project: project.into(),
            sample: sample.into(),
            libprep: libprep.into(),
            seqrun: seqrun.into(),
        }
    }

    pub fn level(&self) -> UnitLevel {
        match self {
            UnitKey::Project { .. } => UnitLevel::Project,
            UnitKey::Sample { .. } => UnitLevel::Sample,
            UnitKey::Libprep { .. } => UnitLevel::Libprep,
            UnitKey::Seqrun { .. } => UnitLevel::Seqrun,
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            UnitKey::Project { project }
            | UnitKey::Sample { project, .. }
            | UnitKey::Libprep { project, .. }
            | UnitKey::Seqrun { project, .. } => project,
        }
    }

    pub fn sample_id(&self) -> Option<&str> {
        match self {
            UnitKey::Project { .. } => None,
            UnitKey::Sample { sample, .. }
            | UnitKey::Libprep { sample, .. }
            | UnitKey::Seqrun { sample, .. } => Some(sample),
        }
    }

    pub fn libprep_id(&self) -> Option<&str> {
        match self {
            UnitKey::Libprep { libprep, .. } | UnitKey::Seqrun { libprep, .. } => Some(libprep),
            _ => None,
        }
    }

    pub fn seqrun_id(&self) -> Option<&str> {
        match self {
            UnitKey::Seqrun { seqrun, .. } => Some(seqrun),
            _ => None,
        }
    }

    /// Ids from the project down, one per level.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids = vec![self.project_id()];
        ids.extend(self.sample_id());
        ids.extend(self.libprep_id());
        ids.extend(self.seqrun_id());
        ids
    }

    pub fn parent(&self) -> Option<UnitKey> {
        match self {
            UnitKey::Project { .. } => None,
            UnitKey::Sample { project, .. } => Some(UnitKey::project(project.clone())),
            UnitKey::Libprep {
                project, sample, ..
            } => Some(UnitKey::sample(project.clone(), sample.clone())),
            UnitKey::Seqrun {
                project,
                sample,
                libprep,
                ..
            } => Some(UnitKey::libprep(
                project.clone(),
                sample.clone(),
                libprep.clone(),
            )),
        }
    }

    /// True for the sample itself and for anything below it.
    pub fn within_sample(&self, project: &str, sample: &str) -> bool {
        self.project_id() == project && self.sample_id() == Some(sample)
    }

    /// Underscore-joined form used in log lines and job names. Not unique;
    /// never parse it back.
    pub fn label(&self) -> String {
        self.ids().join("_")
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ids().join("/"))
    }
}

/// Sequencing run id of the form `YYMMDD_INSTRUMENT_RUN_[AB]FLOWCELL`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeqrunId(String);

impl SeqrunId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn flowcell(&self) -> &str {
        SEQRUN_RE
            .captures(&self.0)
            .and_then(|caps| caps.name("flowcell"))
            .map(|m| m.as_str())
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for SeqrunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SeqrunId {
    type Err = ConductorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !SEQRUN_RE.is_match(trimmed) {
            return Err(ConductorError::InvalidIdentifier(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Parts of an Illumina-style fastq name, `<sample>_S1_L001_R1_001.fastq.gz`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastqName {
    pub sample: String,
    pub sample_number: u32,
    pub lane: u32,
    pub read: u8,
    pub is_index: bool,
}

impl FromStr for FastqName {
    type Err = ConductorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let caps = ILLUMINA_FASTQ_RE
            .captures(value)
            .ok_or_else(|| ConductorError::InvalidIdentifier(value.to_string()))?;
        let number = |name: &str| -> Result<u32, ConductorError> {
            caps[name]
                .parse::<u32>()
                .map_err(|_| ConductorError::InvalidIdentifier(value.to_string()))
        };
        Ok(Self {
            sample: caps["sample"].to_string(),
            sample_number: number("number")?,
            lane: number("lane")?,
            read: number("read")? as u8,
            is_index: &caps["kind"] == "I",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SequencingRun {
    pub id: String,
    pub fastq_files: Vec<String>,
}

impl SequencingRun {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fastq_files: Vec::new(),
        }
    }

    pub fn add_fastq_file(&mut self, file_name: impl Into<String>) {
        let file_name = file_name.into();
        if !self.fastq_files.contains(&file_name) {
            self.fastq_files.push(file_name);
        }
    }
}

impl PartialEq for SequencingRun {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && same_members(&self.fastq_files, &other.fastq_files)
    }
}

#[derive(Debug, Clone)]
pub struct LibraryPrep {
    pub id: String,
    seqruns: Vec<SequencingRun>,
}

impl LibraryPrep {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            seqruns: Vec::new(),
        }
    }

    /// Inserts the run unless one with the same id exists; returns the stored one.
    pub fn add_seqrun(&mut self, seqrun: SequencingRun) -> &mut SequencingRun {
        let index = match self.seqruns.iter().position(|s| s.id == seqrun.id) {
            Some(index) => index,
            None => {
                self.seqruns.push(seqrun);
                self.seqruns.len() - 1
            }
        };
        &mut self.seqruns[index]
    }

    pub fn seqrun(&self, id: &str) -> Option<&SequencingRun> {
        self.seqruns.iter().find(|s| s.id == id)
    }

    pub fn seqruns(&self) -> impl Iterator<Item = &SequencingRun> {
        self.seqruns.iter()
    }

    pub fn retain_seqruns(&mut self, keep: impl FnMut(&SequencingRun) -> bool) {
        self.seqruns.retain(keep);
    }
}

impl PartialEq for LibraryPrep {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && same_members(&self.seqruns, &other.seqruns)
    }
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub id: String,
    libpreps: Vec<LibraryPrep>,
}

impl Sample {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            libpreps: Vec::new(),
        }
    }

    pub fn add_libprep(&mut self, libprep: LibraryPrep) -> &mut LibraryPrep {
        let index = match self.libpreps.iter().position(|l| l.id == libprep.id) {
            Some(index) => index,
            None => {
                self.libpreps.push(libprep);
                self.libpreps.len() - 1
            }
        };
        &mut self.libpreps[index]
    }

    pub fn libprep(&self, id: &str) -> Option<&LibraryPrep> {
        self.libpreps.iter().find(|l| l.id == id)
    }

    pub fn libpreps(&self) -> impl Iterator<Item = &LibraryPrep> {
        self.libpreps.iter()
    }

    pub fn libpreps_mut(&mut self) -> impl Iterator<Item = &mut LibraryPrep> {
        self.libpreps.iter_mut()
    }

    pub fn retain_libpreps(&mut self, keep: impl FnMut(&LibraryPrep) -> bool) {
        self.libpreps.retain(keep);
    }

    /// Every (libprep, seqrun) pair below this sample.
    pub fn seqrun_pairs(&self) -> impl Iterator<Item = (&LibraryPrep, &SequencingRun)> {
        self.libpreps
            .iter()
            .flat_map(|libprep| libprep.seqruns().map(move |seqrun| (libprep, seqrun)))
    }

    pub fn has_seqruns(&self) -> bool {
        self.seqrun_pairs().next().is_some()
    }
}

impl PartialEq for Sample {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && same_members(&self.libpreps, &other.libpreps)
    }
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Root holding `DATA/` and `ANALYSIS/`.
    pub base_path: Utf8PathBuf,
    pub best_practice_analysis: Option<String>,
    pub sequencing_facility: Option<String>,
    samples: Vec<Sample>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, base_path: Utf8PathBuf) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            base_path,
            best_practice_analysis: None,
            sequencing_facility: None,
            samples: Vec::new(),
        }
    }

    pub fn add_sample(&mut self, sample: Sample) -> &mut Sample {
        let index = match self.samples.iter().position(|s| s.id == sample.id) {
            Some(index) => index,
            None => {
                self.samples.push(sample);
                self.samples.len() - 1
            }
        };
        &mut self.samples[index]
    }

    pub fn sample(&self, id: &str) -> Option<&Sample> {
        self.samples.iter().find(|s| s.id == id)
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn retain_samples(&mut self, keep: impl FnMut(&Sample) -> bool) {
        self.samples.retain(keep);
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn key(&self) -> UnitKey {
        UnitKey::project(self.id.clone())
    }

    pub fn data_dir(&self) -> Utf8PathBuf {
        self.base_path.join("DATA").join(&self.id)
    }

    pub fn analysis_dir(&self) -> Utf8PathBuf {
        self.base_path.join("ANALYSIS").join(&self.id)
    }

    pub fn seqrun_dir(&self, sample: &str, libprep: &str, seqrun: &str) -> Utf8PathBuf {
        self.data_dir().join(sample).join(libprep).join(seqrun)
    }

    pub fn fastq_paths(&self, sample: &str, libprep: &str, seqrun: &SequencingRun) -> Vec<Utf8PathBuf> {
        let dir = self.seqrun_dir(sample, libprep, &seqrun.id);
        seqrun
            .fastq_files
            .iter()
            .map(|name| dir.join(name))
            .collect()
    }

    pub fn base_path(&self) -> &Utf8Path {
        &self.base_path
    }
}

impl PartialEq for Project {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.base_path == other.base_path
            && self.best_practice_analysis == other.best_practice_analysis
            && self.sequencing_facility == other.sequencing_facility
            && same_members(&self.samples, &other.samples)
    }
}

fn same_members<T: PartialEq>(left: &[T], right: &[T]) -> bool {
    left.len() == right.len() && left.iter().all(|item| right.contains(item))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_with_delimiters_stay_distinct() {
        let a = UnitKey::sample("P_1", "S");
        let b = UnitKey::sample("P", "1_S");
        assert_eq!(a.label(), b.label());
        assert_ne!(a, b);
    }

    #[test]
    fn parent_walks_up_one_level() {
        let key = UnitKey::seqrun("P1", "P1_101", "A", "190101_ST-E00201_0001_AHXXXXXX");
        assert_eq!(key.parent(), Some(UnitKey::libprep("P1", "P1_101", "A")));
        assert!(key.within_sample("P1", "P1_101"));
        assert!(!key.within_sample("P1", "P1_102"));
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let base = Utf8PathBuf::from("/data");
        let mut left = Project::new("P1", "A.Name_20_01", base.clone());
        left.add_sample(Sample::new("S1"));
        left.add_sample(Sample::new("S2"));
        let mut right = Project::new("P1", "A.Name_20_01", base);
        right.add_sample(Sample::new("S2"));
        right.add_sample(Sample::new("S1"));
        assert_eq!(left, right);

        right
            .add_sample(Sample::new("S1"))
            .add_libprep(LibraryPrep::new("A"));
        assert_ne!(left, right);
    }

    #[test]
    fn adding_existing_child_returns_stored_one() {
        let mut sample = Sample::new("S1");
        sample
            .add_libprep(LibraryPrep::new("A"))
            .add_seqrun(SequencingRun::new("R1"));
        let again = sample.add_libprep(LibraryPrep::new("A"));
        assert!(again.seqrun("R1").is_some());
        assert_eq!(sample.libpreps().count(), 1);
    }

    #[test]
    fn parse_illumina_fastq_name() {
        let name: FastqName = "P1_101_S1_L002_R2_001.fastq.gz".parse().unwrap();
        assert_eq!(name.sample, "P1_101");
        assert_eq!(name.lane, 2);
        assert_eq!(name.read, 2);
        assert!(!name.is_index);
        assert!(is_fastq("reads.fq.bz2"));
        assert!(!is_fastq("reads.bam"));
    }

    #[test]
    fn seqrun_id_exposes_flowcell() {
        let id: SeqrunId = "190101_ST-E00201_0123_AHXXXXXX".parse().unwrap();
        assert_eq!(id.flowcell(), "HXXXXXX");
        assert!("not-a-run".parse::<SeqrunId>().is_err());
    }
}
