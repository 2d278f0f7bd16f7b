use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::config::CharonConfig;
use crate::domain::{UnitKey, UnitLevel};
use crate::error::ConductorError;
use crate::metrics::AnalysisMetrics;
use crate::status::{
    PROJECT_STATUS, ProcessStatus, SAMPLE_ANALYSIS, SEQRUN_ALIGNMENT, StatusVocabulary,
    alignment_status_for_analysis,
};

pub type Fields = Map<String, Value>;

/// One flat Charon document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharonRecord(pub Fields);

impl CharonRecord {
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.0
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn fields(&self) -> &Fields {
        &self.0
    }
}

impl From<Value> for CharonRecord {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => CharonRecord(map),
            _ => CharonRecord::default(),
        }
    }
}

pub trait CharonClient: Send + Sync {
    fn get(&self, unit: &UnitKey) -> Result<CharonRecord, ConductorError>;
    fn create(&self, unit: &UnitKey, fields: Fields) -> Result<CharonRecord, ConductorError>;
    fn update(&self, unit: &UnitKey, fields: Fields) -> Result<(), ConductorError>;
    /// Clears status fields back to a fresh state.
    fn reset(&self, unit: &UnitKey) -> Result<(), ConductorError>;
    /// Samples of a project, libpreps of a sample, seqruns of a libprep.
    fn list_children(&self, parent: &UnitKey) -> Result<Vec<CharonRecord>, ConductorError>;
    fn list_projects(&self) -> Result<Vec<CharonRecord>, ConductorError>;
}

pub fn id_field(level: UnitLevel) -> &'static str {
    match level {
        UnitLevel::Project => "projectid",
        UnitLevel::Sample => "sampleid",
        UnitLevel::Libprep => "libprepid",
        UnitLevel::Seqrun => "seqrunid",
    }
}

fn status_field(level: UnitLevel) -> &'static str {
    match StatusVocabulary::for_level(level) {
        Some(vocabulary) => vocabulary.field,
        None => "qc",
    }
}

#[derive(Clone)]
pub struct CharonHttpClient {
    client: Client,
    base_url: String,
}

impl CharonHttpClient {
    pub fn new(config: &CharonConfig) -> Result<Self, ConductorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ngi-conductor/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ConductorError::CharonHttp(err.to_string()))?,
        );
        if let Some(token) = &config.api_token {
            headers.insert(
                "X-Charon-API-token",
                HeaderValue::from_str(token.trim())
                    .map_err(|err| ConductorError::CharonHttp(err.to_string()))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|err| ConductorError::CharonHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> String {
        format!("{}/api/v1/{}", self.base_url, segments.join("/"))
    }

    fn unit_url(&self, unit: &UnitKey) -> String {
        let mut segments = vec![unit.level().as_str()];
        segments.extend(unit.ids());
        self.url(&segments)
    }

    fn send(&self, request: RequestBuilder, unit: &str) -> Result<Response, ConductorError> {
        let response = request
            .send()
            .map_err(|err| ConductorError::CharonHttp(err.to_string()))?;
        check_status(response, unit)
    }

    fn list(&self, segments: &[&str], key: &str) -> Result<Vec<CharonRecord>, ConductorError> {
        let url = self.url(segments);
        let path = segments.join("/");
        let response = self.send(self.client.get(&url), &path)?;
        let body = read_body(response, &path)?;
        Ok(body
            .get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().cloned().map(CharonRecord::from).collect())
            .unwrap_or_default())
    }
}

fn read_body(response: Response, unit: &str) -> Result<Value, ConductorError> {
    let text = response
        .text()
        .map_err(|err| ConductorError::CharonHttp(err.to_string()))?;
    parse_body(&text, unit)
}

/// A body that is not JSON is a problem with one record, not with the
/// connection.
fn parse_body(text: &str, unit: &str) -> Result<Value, ConductorError> {
    serde_json::from_str(text).map_err(|err| ConductorError::CharonDecode {
        unit: unit.to_string(),
        message: err.to_string(),
    })
}

fn check_status(response: Response, unit: &str) -> Result<Response, ConductorError> {
    let status = response.status().as_u16();
    if response.status().is_success() {
        return Ok(response);
    }
    match status {
        404 => Err(ConductorError::CharonNotFound(unit.to_string())),
        400 | 409 => Err(ConductorError::CharonConflict(unit.to_string())),
        405 => Err(ConductorError::CharonMethodNotAllowed(unit.to_string())),
        _ => {
            let message = response
                .text()
                .unwrap_or_else(|_| "Charon request failed".to_string());
            Err(ConductorError::CharonStatus { status, message })
        }
    }
}

impl CharonClient for CharonHttpClient {
    fn get(&self, unit: &UnitKey) -> Result<CharonRecord, ConductorError> {
        let response = self.send(self.client.get(self.unit_url(unit)), &unit.to_string())?;
        let body = read_body(response, &unit.to_string())?;
        Ok(CharonRecord::from(body))
    }

    fn create(&self, unit: &UnitKey, mut fields: Fields) -> Result<CharonRecord, ConductorError> {
        let ids = unit.ids();
        let (own_id, parent_ids) = ids
            .split_last()
            .ok_or_else(|| ConductorError::InvalidIdentifier(unit.to_string()))?;
        fields.insert(id_field(unit.level()).to_string(), json!(own_id));

        let mut segments = vec![unit.level().as_str()];
        segments.extend(parent_ids.iter().copied());
        let url = self.url(&segments);
        let response = self.send(
            self.client.post(&url).json(&Value::Object(fields)),
            &unit.to_string(),
        )?;
        let body: Value = response.json().unwrap_or(Value::Null);
        Ok(CharonRecord::from(body))
    }

    fn update(&self, unit: &UnitKey, fields: Fields) -> Result<(), ConductorError> {
        self.send(
            self.client
                .put(self.unit_url(unit))
                .json(&Value::Object(fields)),
            &unit.to_string(),
        )?;
        Ok(())
    }

    fn reset(&self, unit: &UnitKey) -> Result<(), ConductorError> {
        let url = format!("{}/reset", self.unit_url(unit));
        self.send(self.client.put(&url), &unit.to_string())?;
        Ok(())
    }

    fn list_children(&self, parent: &UnitKey) -> Result<Vec<CharonRecord>, ConductorError> {
        let (collection, key) = match parent.level() {
            UnitLevel::Project => ("samples", "samples"),
            UnitLevel::Sample => ("libpreps", "libpreps"),
            UnitLevel::Libprep => ("seqruns", "seqruns"),
            UnitLevel::Seqrun => return Ok(Vec::new()),
        };
        let mut segments = vec![collection];
        segments.extend(parent.ids());
        self.list(&segments, key)
    }

    fn list_projects(&self) -> Result<Vec<CharonRecord>, ConductorError> {
        self.list(&["projects"], "projects")
    }
}

/// Typed operations over a [`CharonClient`].
pub struct StatusConnector<C: CharonClient> {
    client: C,
}

impl<C: CharonClient> StatusConnector<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Status field of `unit` at its level. A unit Charon has never heard of
    /// has no status; every other failure propagates.
    pub fn status(&self, unit: &UnitKey) -> Result<Option<String>, ConductorError> {
        match self.client.get(unit) {
            Ok(record) => Ok(record
                .str_field(status_field(unit.level()))
                .map(str::to_string)),
            Err(err) if err.is_not_found() => {
                debug!(unit = %unit, "no Charon record, treating status as unset");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn best_practice_analysis(&self, project_id: &str) -> Result<Option<String>, ConductorError> {
        let record = self.client.get(&UnitKey::project(project_id))?;
        Ok(record
            .str_field("best_practice_analysis")
            .map(str::to_string))
    }

    pub fn project_name(&self, project_id: &str) -> Result<Option<String>, ConductorError> {
        let record = self.client.get(&UnitKey::project(project_id))?;
        Ok(record.str_field("name").map(str::to_string))
    }

    pub fn project_id_from_name(&self, name: &str) -> Result<String, ConductorError> {
        let projects = self.client.list_projects()?;
        projects
            .iter()
            .find(|record| record.str_field("name") == Some(name))
            .and_then(|record| record.str_field("projectid"))
            .map(str::to_string)
            .ok_or_else(|| ConductorError::CharonNotFound(format!("project named {name}")))
    }

    pub fn child_ids(&self, parent: &UnitKey) -> Result<Vec<String>, ConductorError> {
        let child_level = match parent.level() {
            UnitLevel::Project => UnitLevel::Sample,
            UnitLevel::Sample => UnitLevel::Libprep,
            UnitLevel::Libprep | UnitLevel::Seqrun => UnitLevel::Seqrun,
        };
        Ok(self
            .client
            .list_children(parent)?
            .iter()
            .filter_map(|record| record.str_field(id_field(child_level)))
            .map(str::to_string)
            .collect())
    }

    /// Libprep of `sample` whose Charon seqruns include `seqrun`.
    pub fn libprep_for_seqrun(
        &self,
        project_id: &str,
        sample: &str,
        seqrun: &str,
    ) -> Result<Option<String>, ConductorError> {
        for libprep in self.child_ids(&UnitKey::sample(project_id, sample))? {
            let seqruns = self.child_ids(&UnitKey::libprep(project_id, sample, libprep.as_str()))?;
            if seqruns.iter().any(|id| id == seqrun) {
                return Ok(Some(libprep));
            }
        }
        Ok(None)
    }

    /// Writes the status reporting `process` at the unit's own level. Sample
    /// updates also propagate to every seqrun of the sample.
    pub fn report_process_status(
        &self,
        unit: &UnitKey,
        process: ProcessStatus,
    ) -> Result<(), ConductorError> {
        match unit {
            UnitKey::Project { project } => {
                self.set_project_status(project, PROJECT_STATUS.status_for(process))
            }
            UnitKey::Sample { project, sample } => self.set_sample_analysis_status(
                project,
                sample,
                SAMPLE_ANALYSIS.status_for(process),
                true,
            ),
            UnitKey::Libprep { .. } => Err(ConductorError::InvalidIdentifier(format!(
                "libprep {unit} has no process status"
            ))),
            UnitKey::Seqrun { .. } => {
                self.set_seqrun_alignment_status(unit, SEQRUN_ALIGNMENT.status_for(process))
            }
        }
    }

    pub fn set_project_status(&self, project_id: &str, status: &str) -> Result<(), ConductorError> {
        info!(project = project_id, status, "updating project status");
        self.client.update(
            &UnitKey::project(project_id),
            fields([("status", json!(status))]),
        )
    }

    pub fn set_sample_analysis_status(
        &self,
        project_id: &str,
        sample: &str,
        status: &str,
        recurse: bool,
    ) -> Result<(), ConductorError> {
        let unit = UnitKey::sample(project_id, sample);
        info!(unit = %unit, status, "updating sample analysis status");
        self.client
            .update(&unit, fields([("analysis_status", json!(status))]))?;
        if !recurse {
            return Ok(());
        }

        let Some(alignment_status) = alignment_status_for_analysis(status) else {
            return Ok(());
        };
        let mut first_error = None;
        for libprep in self.child_ids(&unit)? {
            let libprep_key = UnitKey::libprep(project_id, sample, libprep.as_str());
            for seqrun in self.child_ids(&libprep_key)? {
                let seqrun_key = UnitKey::seqrun(project_id, sample, libprep.as_str(), seqrun);
                if let Err(err) = self.set_seqrun_alignment_status(&seqrun_key, alignment_status)
                {
                    warn!(unit = %seqrun_key, error = %err, "failed to update seqrun alignment status");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn set_seqrun_alignment_status(
        &self,
        unit: &UnitKey,
        status: &str,
    ) -> Result<(), ConductorError> {
        debug!(unit = %unit, status, "updating seqrun alignment status");
        self.client
            .update(unit, fields([("alignment_status", json!(status))]))
    }

    pub fn set_sample_metrics(
        &self,
        project_id: &str,
        sample: &str,
        metrics: &AnalysisMetrics,
    ) -> Result<(), ConductorError> {
        let mut update = Fields::new();
        if let Some(total_reads) = metrics.total_reads {
            update.insert("total_reads".to_string(), json!(total_reads));
        }
        if let Some(coverage) = metrics.autosomal_coverage {
            update.insert("total_autosomal_coverage".to_string(), json!(coverage));
        }
        if let Some(duplication) = metrics.percent_duplication {
            update.insert("duplication_pc".to_string(), json!(duplication));
        }
        if update.is_empty() {
            return Ok(());
        }
        self.client.update(&UnitKey::sample(project_id, sample), update)
    }

    pub fn reset(&self, unit: &UnitKey) -> Result<(), ConductorError> {
        info!(unit = %unit, "resetting Charon record");
        self.client.reset(unit)
    }
}

pub fn fields<const N: usize>(entries: [(&str, Value); N]) -> Fields {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_fields_ignore_blank_values() {
        let record = CharonRecord::from(json!({"analysis_status": " ", "qc": "PASSED"}));
        assert_eq!(record.str_field("analysis_status"), None);
        assert_eq!(record.str_field("qc"), Some("PASSED"));
        assert_eq!(CharonRecord::from(json!([1, 2])), CharonRecord::default());
    }

    #[test]
    fn unreadable_body_is_a_record_error() {
        let err = parse_body("<html>502</html>", "sample/P1/P1_101").unwrap_err();
        assert!(matches!(err, ConductorError::CharonDecode { ref unit, .. } if unit == "sample/P1/P1_101"));
        assert!(!err.is_systemic());
        assert_eq!(parse_body("{\"qc\": \"PASSED\"}", "x").unwrap(), json!({"qc": "PASSED"}));
    }

    #[test]
    fn libpreps_report_qc_field() {
        assert_eq!(status_field(UnitLevel::Libprep), "qc");
        assert_eq!(status_field(UnitLevel::Seqrun), "alignment_status");
        assert_eq!(id_field(UnitLevel::Seqrun), "seqrunid");
    }
}
