use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::charon::{CharonClient, Fields, StatusConnector, fields};
use crate::config::OrganizeDefaults;
use crate::domain::{LibraryPrep, Project, Sample, SequencingRun, UnitKey, UnitLevel, is_fastq};
use crate::error::ConductorError;
use crate::flowcell::{Flowcell, FlowcellProject, FlowcellSample};
use crate::fs_util;
use crate::notify::{Notice, Notifier};
use crate::status::{PROJECT_STATUS, QC_PASSED, SAMPLE_ANALYSIS, SAMPLE_STALE, SEQRUN_ALIGNMENT};

/// Restricts which projects and samples of a flowcell are organized.
#[derive(Debug, Clone, Default)]
pub struct OrganizeFilter {
    pub projects: Vec<String>,
    pub samples: Vec<String>,
    pub fallback_libprep: Option<String>,
}

impl OrganizeFilter {
    fn wants_project(&self, name: &str) -> bool {
        self.projects.is_empty() || self.projects.iter().any(|p| p == name)
    }

    fn wants_sample(&self, name: &str) -> bool {
        self.samples.is_empty() || self.samples.iter().any(|s| s == name)
    }
}

#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    pub best_practice_analysis: String,
    pub sequencing_facility: String,
    pub pipeline: String,
    pub reference: String,
    pub force_overwrite: bool,
}

impl RegistrationOptions {
    pub fn from_defaults(defaults: &OrganizeDefaults) -> Self {
        Self {
            best_practice_analysis: defaults.best_practice_analysis.clone(),
            sequencing_facility: defaults.sequencing_facility.clone(),
            pipeline: defaults.pipeline.clone(),
            reference: defaults.reference.clone(),
            force_overwrite: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    Created,
    Updated,
    Existing,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrationReport {
    pub project: String,
    pub units: Vec<RegisteredUnit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredUnit {
    pub unit: UnitKey,
    pub outcome: Registration,
}

impl RegistrationReport {
    pub fn count(&self, outcome: Registration) -> usize {
        self.units.iter().filter(|u| u.outcome == outcome).count()
    }

    fn push(&mut self, unit: &UnitKey, outcome: Registration) {
        self.units.push(RegisteredUnit {
            unit: unit.clone(),
            outcome,
        });
    }
}

/// Sorts demultiplexed flowcells into `DATA/` and registers what it finds in
/// Charon.
pub struct Organizer<'a, C: CharonClient> {
    charon: &'a StatusConnector<C>,
    notifier: &'a dyn Notifier,
    top_dir: Utf8PathBuf,
    project_id_fallback: bool,
}

impl<'a, C: CharonClient> Organizer<'a, C> {
    pub fn new(
        charon: &'a StatusConnector<C>,
        notifier: &'a dyn Notifier,
        top_dir: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            charon,
            notifier,
            top_dir: top_dir.into(),
            project_id_fallback: false,
        }
    }

    /// Use the project name as id when Charon has no project by that name.
    pub fn with_project_id_fallback(mut self, enabled: bool) -> Self {
        self.project_id_fallback = enabled;
        self
    }

    /// Adds the flowcell's projects to `projects`, keyed by project id, and
    /// links its fastq files into the DATA tree.
    pub fn organize_flowcell(
        &self,
        flowcell: &Flowcell,
        filter: &OrganizeFilter,
        projects: &mut BTreeMap<String, Project>,
    ) -> Result<(), ConductorError> {
        if !self.top_dir.as_std_path().is_dir() {
            return Err(ConductorError::Filesystem(format!(
                "analysis top directory {} does not exist",
                self.top_dir
            )));
        }
        info!(flowcell = %flowcell.dir, seqrun = %flowcell.seqrun, "organizing flowcell");

        for source in &flowcell.projects {
            if !filter.wants_project(&source.name) {
                debug!(project = %source.name, "skipping project not in filter");
                continue;
            }
            let Some(project_id) = self.resolve_project_id(&source.name)? else {
                continue;
            };
            let project = match projects.entry(project_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let project = self.prepare_project(entry.key(), &source.name)?;
                    entry.insert(project)
                }
            };
            self.organize_project(flowcell, source, filter, project)?;
        }
        Ok(())
    }

    fn prepare_project(&self, project_id: &str, name: &str) -> Result<Project, ConductorError> {
        let project = Project::new(project_id, name, self.top_dir.clone());
        fs_util::ensure_dir(&project.data_dir())?;
        fs_util::ensure_dir(&project.analysis_dir())?;
        if name != project_id {
            let data_link = self.top_dir.join("DATA").join(name);
            let analysis_link = self.top_dir.join("ANALYSIS").join(name);
            link_if_absent(&project.data_dir(), &data_link);
            link_if_absent(&project.analysis_dir(), &analysis_link);
        }
        Ok(project)
    }

    fn organize_project(
        &self,
        flowcell: &Flowcell,
        source: &FlowcellProject,
        filter: &OrganizeFilter,
        project: &mut Project,
    ) -> Result<(), ConductorError> {
        info!(project = %project.id, name = %source.name, "setting up project");
        for source_sample in &source.samples {
            if !filter.wants_sample(&source_sample.name) {
                debug!(sample = %source_sample.name, "skipping sample not in filter");
                continue;
            }
            let seqrun = flowcell.seqrun.as_str();
            let Some(libprep) = self.resolve_libprep(
                &project.id,
                &project.name,
                &source_sample.name,
                seqrun,
                filter.fallback_libprep.as_deref(),
            )?
            else {
                continue;
            };
            self.link_sample(project, source_sample, &libprep, seqrun);
        }
        Ok(())
    }

    fn link_sample(
        &self,
        project: &mut Project,
        source: &FlowcellSample,
        libprep: &str,
        seqrun: &str,
    ) {
        let seqrun_dir = project.seqrun_dir(&source.name, libprep, seqrun);
        let mut linked = Vec::new();
        for fastq in &source.fastq_files {
            let result = fs_util::symlink_force(&source.dir.join(fastq), &seqrun_dir.join(fastq));
            match result {
                Ok(()) => linked.push(fastq.clone()),
                Err(err) => {
                    error!(path = %seqrun_dir, error = %err, "could not link fastq file");
                    self.notifier.notify(
                        &Notice::error(
                            &project.name,
                            format!("could not link {fastq} into {seqrun_dir}: {err}"),
                        )
                        .with_sample(&source.name),
                    );
                }
            }
        }
        if linked.is_empty() {
            return;
        }
        info!(
            project = %project.id,
            sample = %source.name,
            libprep,
            seqrun,
            files = linked.len(),
            "linked fastq files"
        );
        let run = project
            .add_sample(Sample::new(source.name.as_str()))
            .add_libprep(LibraryPrep::new(libprep))
            .add_seqrun(SequencingRun::new(seqrun));
        for fastq in linked {
            run.add_fastq_file(fastq);
        }
    }

    /// Project id for `name`, `None` when the project has to be skipped.
    pub fn resolve_project_id(&self, name: &str) -> Result<Option<String>, ConductorError> {
        match self.charon.project_id_from_name(name) {
            Ok(project_id) => Ok(Some(project_id)),
            Err(err) if err.is_systemic() => Err(err),
            Err(err) if self.project_id_fallback => {
                warn!(
                    project = name,
                    error = %err,
                    "no project id in Charon, using the project name as id"
                );
                Ok(Some(name.to_string()))
            }
            Err(err) => {
                error!(project = name, error = %err, "could not resolve project id, skipping project");
                self.notifier.notify(&Notice::error(
                    name,
                    format!("could not resolve project id for {name}: {err}"),
                ));
                Ok(None)
            }
        }
    }

    /// Libprep that `seqrun` belongs to: the one Charon lists the run under,
    /// else the sample's only libprep, else `fallback`.
    pub fn resolve_libprep(
        &self,
        project_id: &str,
        project_name: &str,
        sample: &str,
        seqrun: &str,
        fallback: Option<&str>,
    ) -> Result<Option<String>, ConductorError> {
        match self.charon.libprep_for_seqrun(project_id, sample, seqrun) {
            Ok(Some(libprep)) => return Ok(Some(libprep)),
            Ok(None) => {}
            Err(err) if err.is_systemic() => return Err(err),
            Err(err) => debug!(sample, error = %err, "no libprep information in Charon"),
        }

        let libpreps = match self.charon.child_ids(&UnitKey::sample(project_id, sample)) {
            Ok(libpreps) => libpreps,
            Err(err) if err.is_systemic() => return Err(err),
            Err(_) => Vec::new(),
        };
        if let [only] = libpreps.as_slice() {
            warn!(
                sample,
                seqrun,
                libprep = %only,
                "seqrun has no libprep in Charon, using the only libprep on record"
            );
            return Ok(Some(only.clone()));
        }
        if let Some(fallback) = fallback {
            warn!(sample, seqrun, libprep = fallback, "using fallback libprep");
            return Ok(Some(fallback.to_string()));
        }

        let message = format!(
            "{project_name} / {sample} / {seqrun} has no libprep information in Charon, skipping analysis"
        );
        error!(project = project_id, sample, seqrun, "{message}");
        self.notifier
            .notify(&Notice::error(project_name, message).with_sample(sample));
        Ok(None)
    }

    /// Creates the Charon records for every unit of `project`. Running it
    /// twice without `force_overwrite` leaves Charon as it was after the first
    /// run, apart from marking existing samples stale.
    pub fn register_project(
        &self,
        project: &Project,
        options: &RegistrationOptions,
    ) -> Result<RegistrationReport, ConductorError> {
        let mut report = RegistrationReport {
            project: project.id.clone(),
            units: Vec::new(),
        };
        let project_fields = fields([
            ("name", json!(project.name)),
            (PROJECT_STATUS.field, json!(PROJECT_STATUS.fresh)),
            ("best_practice_analysis", json!(options.best_practice_analysis)),
            ("sequencing_facility", json!(options.sequencing_facility)),
            ("pipeline", json!(options.pipeline)),
            ("reference", json!(options.reference)),
        ]);
        let outcome = self.register_unit(&project.key(), project_fields, options, &mut report)?;
        if outcome == Registration::Failed {
            return Ok(report);
        }

        for sample in project.samples() {
            let unit = UnitKey::sample(project.id.as_str(), sample.id.as_str());
            let sample_fields = fields([(SAMPLE_ANALYSIS.field, json!(SAMPLE_ANALYSIS.fresh))]);
            match self.register_unit(&unit, sample_fields, options, &mut report)? {
                Registration::Failed => continue,
                Registration::Existing => self.mark_stale(&unit)?,
                _ => {}
            }

            for libprep in sample.libpreps() {
                let unit = UnitKey::libprep(
                    project.id.as_str(),
                    sample.id.as_str(),
                    libprep.id.as_str(),
                );
                let libprep_fields = fields([("qc", json!(QC_PASSED))]);
                if self.register_unit(&unit, libprep_fields, options, &mut report)?
                    == Registration::Failed
                {
                    continue;
                }
                for seqrun in libprep.seqruns() {
                    let unit = UnitKey::seqrun(
                        project.id.as_str(),
                        sample.id.as_str(),
                        libprep.id.as_str(),
                        seqrun.id.as_str(),
                    );
                    let seqrun_fields = fields([
                        (SEQRUN_ALIGNMENT.field, json!(SEQRUN_ALIGNMENT.fresh)),
                        ("total_reads", Value::from(0)),
                        ("mean_autosomal_coverage", Value::from(0)),
                    ]);
                    self.register_unit(&unit, seqrun_fields, options, &mut report)?;
                }
            }
        }
        info!(
            project = %project.id,
            created = report.count(Registration::Created),
            updated = report.count(Registration::Updated),
            existing = report.count(Registration::Existing),
            failed = report.count(Registration::Failed),
            "registered project in Charon"
        );
        Ok(report)
    }

    fn register_unit(
        &self,
        unit: &UnitKey,
        unit_fields: Fields,
        options: &RegistrationOptions,
        report: &mut RegistrationReport,
    ) -> Result<Registration, ConductorError> {
        let outcome = match self.charon.client().create(unit, unit_fields.clone()) {
            Ok(_) => {
                info!(unit = %unit, "created in Charon");
                Registration::Created
            }
            Err(err) if err.is_conflict() && options.force_overwrite => {
                warn!(unit = %unit, "overwriting existing Charon record");
                let mut unit_fields = unit_fields;
                if unit.level() == UnitLevel::Sample {
                    unit_fields.insert("status".to_string(), json!(SAMPLE_STALE));
                }
                match self.charon.client().update(unit, unit_fields) {
                    Ok(()) => Registration::Updated,
                    Err(err) if err.is_systemic() => return Err(err),
                    Err(err) => {
                        error!(unit = %unit, error = %err, "could not overwrite Charon record");
                        Registration::Failed
                    }
                }
            }
            Err(err) if err.is_conflict() => {
                debug!(unit = %unit, "already registered in Charon");
                Registration::Existing
            }
            Err(err) if err.is_systemic() => return Err(err),
            Err(err) => {
                error!(unit = %unit, error = %err, "could not register in Charon");
                Registration::Failed
            }
        };
        report.push(unit, outcome);
        Ok(outcome)
    }

    fn mark_stale(&self, unit: &UnitKey) -> Result<(), ConductorError> {
        match self
            .charon
            .client()
            .update(unit, fields([("status", json!(SAMPLE_STALE))]))
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_systemic() => Err(err),
            Err(err) => {
                warn!(unit = %unit, error = %err, "could not mark sample stale");
                Ok(())
            }
        }
    }
}

fn link_if_absent(target: &Utf8Path, link: &Utf8Path) {
    if fs::symlink_metadata(link.as_std_path()).is_ok() {
        return;
    }
    if let Err(err) = fs_util::symlink_force(target, link) {
        warn!(link = %link, error = %err, "could not create project name link");
    }
}

/// Rebuilds a project from `<top>/DATA/<project>/<sample>/<libprep>/<seqrun>/`.
/// `project_dir` may be the name link; the id comes from the resolved path.
pub fn project_from_filesystem(
    project_dir: &Utf8Path,
    samples: &[String],
) -> Result<Project, ConductorError> {
    let resolved = fs::canonicalize(project_dir.as_std_path())
        .map_err(|err| ConductorError::Filesystem(format!("resolve {project_dir}: {err}")))?;
    let resolved = Utf8PathBuf::from_path_buf(resolved).map_err(|path| {
        ConductorError::Filesystem(format!("non UTF-8 path {}", path.display()))
    })?;
    let base_path = resolved
        .parent()
        .and_then(Utf8Path::parent)
        .ok_or_else(|| {
            ConductorError::Filesystem(format!("{project_dir} is not inside a DATA directory"))
        })?
        .to_path_buf();
    let project_id = fs_util::file_name(&resolved).to_string();
    let name = fs_util::file_name(project_dir).to_string();
    let mut project = Project::new(project_id, name, base_path);

    for sample_dir in fs_util::subdirs(&resolved)? {
        let sample_id = fs_util::file_name(&sample_dir);
        if !samples.is_empty() && !samples.iter().any(|s| s == sample_id) {
            continue;
        }
        let mut sample = Sample::new(sample_id);
        for libprep_dir in fs_util::subdirs(&sample_dir)? {
            let libprep = sample.add_libprep(LibraryPrep::new(fs_util::file_name(&libprep_dir)));
            for seqrun_dir in fs_util::subdirs(&libprep_dir)? {
                let mut seqrun = SequencingRun::new(fs_util::file_name(&seqrun_dir));
                for file in fs_util::walk_files(&seqrun_dir)? {
                    let file_name = fs_util::file_name(&file);
                    if is_fastq(file_name) {
                        seqrun.add_fastq_file(file_name);
                    }
                }
                if !seqrun.fastq_files.is_empty() {
                    libprep.add_seqrun(seqrun);
                }
            }
        }
        sample.retain_libpreps(|libprep| libprep.seqruns().next().is_some());
        if sample.has_seqruns() {
            project.add_sample(sample);
        } else {
            debug!(sample = sample_id, "no fastq files below sample directory");
        }
    }
    Ok(project)
}
