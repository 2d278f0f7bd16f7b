use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::ConductorError;

pub const CONFIG_ENV: &str = "NGI_CONFIG";
pub const CHARON_BASE_URL_ENV: &str = "CHARON_BASE_URL";
pub const CHARON_API_TOKEN_ENV: &str = "CHARON_API_TOKEN";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub charon: CharonSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub analysis: AnalysisSection,
    #[serde(default)]
    pub environment: EnvironmentSection,
    #[serde(default)]
    pub slurm: SlurmSection,
    #[serde(default)]
    pub qc: QcSection,
    #[serde(default)]
    pub mail: MailSection,
    #[serde(default)]
    pub organize: OrganizeSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CharonSection {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DatabaseSection {
    #[serde(default)]
    pub record_tracking_db_path: Option<Utf8PathBuf>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AnalysisSection {
    #[serde(default)]
    pub top_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub best_practice_analysis: BTreeMap<String, String>,
    #[serde(default)]
    pub workflows: WorkflowsSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct WorkflowsSection {
    #[serde(default)]
    pub sarek: SarekSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SarekSection {
    #[serde(default)]
    pub nextflow: Option<String>,
    #[serde(default)]
    pub sarek_path: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub genome: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EnvironmentSection {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub executor: Option<ExecutorKind>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SlurmSection {
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub mail_user: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct QcSection {
    #[serde(default)]
    pub fastqc: Option<String>,
    #[serde(default)]
    pub fastq_screen: Option<String>,
    #[serde(default)]
    pub fastq_screen_config: Option<Utf8PathBuf>,
    #[serde(default)]
    pub threads: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MailSection {
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub sendmail: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct OrganizeSection {
    #[serde(default)]
    pub project_id_fallback: Option<bool>,
    #[serde(default)]
    pub sequencing_facility: Option<String>,
    #[serde(default)]
    pub best_practice_analysis: Option<String>,
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Local,
    Slurm,
}

#[derive(Debug, Clone)]
pub struct CharonConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SlurmConfig {
    pub account: Option<String>,
    pub partition: String,
    pub cores: u32,
    pub time: String,
    pub mail_user: Option<String>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SarekConfig {
    pub nextflow: String,
    pub sarek_path: String,
    pub profile: String,
    pub genome: String,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct QcConfig {
    pub fastqc: String,
    pub fastq_screen: String,
    pub fastq_screen_config: Option<Utf8PathBuf>,
    pub threads: u32,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub recipient: Option<String>,
    pub sender: String,
    pub sendmail: String,
}

#[derive(Debug, Clone)]
pub struct OrganizeDefaults {
    pub project_id_fallback: bool,
    pub sequencing_facility: String,
    pub best_practice_analysis: String,
    pub pipeline: String,
    pub reference: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub charon: CharonConfig,
    pub tracking_db_path: Option<Utf8PathBuf>,
    pub top_dir: Option<Utf8PathBuf>,
    pub executor: ExecutorKind,
    pub slurm: SlurmConfig,
    /// Best-practice label -> workflow identifier.
    pub best_practice_workflows: BTreeMap<String, String>,
    pub sarek: SarekConfig,
    pub qc: QcConfig,
    pub mail: MailConfig,
    pub organize: OrganizeDefaults,
}

impl ResolvedConfig {
    pub fn tracking_db_path(&self) -> Result<&Utf8Path, ConductorError> {
        self.tracking_db_path.as_deref().ok_or_else(|| {
            ConductorError::MissingConfigKey("database.record_tracking_db_path".to_string())
        })
    }

    pub fn top_dir(&self) -> Result<&Utf8Path, ConductorError> {
        self.top_dir
            .as_deref()
            .ok_or_else(|| ConductorError::MissingConfigKey("analysis.top_dir".to_string()))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ConductorError> {
        let config_path = Self::config_path(path)?;
        if !config_path.as_std_path().exists() {
            return Err(ConductorError::MissingConfig(config_path));
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| ConductorError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| ConductorError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn config_path(path: Option<&str>) -> Result<Utf8PathBuf, ConductorError> {
        if let Some(path) = path {
            return Ok(Utf8PathBuf::from(path));
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return Ok(Utf8PathBuf::from(path.trim()));
            }
        }
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.home_dir().join(".ngipipeline").join("ngi_config.json"),
                )
                .ok()
            })
            .ok_or_else(|| {
                ConductorError::Filesystem("unable to resolve home directory".to_string())
            })
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ConductorError> {
        Self::resolve_config_with_env(config, |name| std::env::var(name).ok())
    }

    pub fn resolve_config_with_env(
        config: Config,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ResolvedConfig, ConductorError> {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let base_url = non_empty(env(CHARON_BASE_URL_ENV))
            .or(non_empty(config.charon.base_url))
            .ok_or_else(|| ConductorError::MissingConfigKey("charon.base_url".to_string()))?;
        let api_token = non_empty(env(CHARON_API_TOKEN_ENV)).or(non_empty(config.charon.api_token));
        let charon = CharonConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            timeout: Duration::from_secs(config.charon.timeout_secs.unwrap_or(30)),
        };

        let executor = config.environment.executor.unwrap_or_default();
        let account = non_empty(config.environment.project_id);
        if executor == ExecutorKind::Slurm && account.is_none() {
            return Err(ConductorError::MissingConfigKey(
                "environment.project_id".to_string(),
            ));
        }

        let slurm = SlurmConfig {
            account,
            partition: config.slurm.partition.unwrap_or_else(|| "core".to_string()),
            cores: config.slurm.cores.unwrap_or(16),
            time: config.slurm.time.unwrap_or_else(|| "48:00:00".to_string()),
            mail_user: config.slurm.mail_user,
            extra_args: config.slurm.extra_args,
        };

        let mut best_practice_workflows = default_best_practice_workflows();
        best_practice_workflows.extend(
            config
                .analysis
                .best_practice_analysis
                .into_iter()
                .map(|(label, workflow)| (label.to_lowercase(), workflow)),
        );

        let sarek_section = config.analysis.workflows.sarek;
        let sarek = SarekConfig {
            nextflow: sarek_section
                .nextflow
                .unwrap_or_else(|| "nextflow".to_string()),
            sarek_path: sarek_section
                .sarek_path
                .unwrap_or_else(|| "nf-core/sarek".to_string()),
            profile: sarek_section.profile.unwrap_or_else(|| "uppmax".to_string()),
            genome: sarek_section.genome.unwrap_or_else(|| "GRCh38".to_string()),
            extra_args: sarek_section.extra_args,
        };

        let qc = QcConfig {
            fastqc: config.qc.fastqc.unwrap_or_else(|| "fastqc".to_string()),
            fastq_screen: config
                .qc
                .fastq_screen
                .unwrap_or_else(|| "fastq_screen".to_string()),
            fastq_screen_config: config.qc.fastq_screen_config,
            threads: config.qc.threads.unwrap_or(1),
        };

        let mail = MailConfig {
            recipient: non_empty(config.mail.recipient),
            sender: config
                .mail
                .sender
                .unwrap_or_else(|| "ngi-conductor@localhost".to_string()),
            sendmail: config
                .mail
                .sendmail
                .unwrap_or_else(|| "sendmail".to_string()),
        };

        let organize = OrganizeDefaults {
            project_id_fallback: config.organize.project_id_fallback.unwrap_or(false),
            sequencing_facility: config
                .organize
                .sequencing_facility
                .unwrap_or_else(|| "NGI-S".to_string()),
            best_practice_analysis: config
                .organize
                .best_practice_analysis
                .unwrap_or_else(|| "wgs_germline".to_string()),
            pipeline: config
                .organize
                .pipeline
                .unwrap_or_else(|| "sarek".to_string()),
            reference: config
                .organize
                .reference
                .unwrap_or_else(|| "GRCh38".to_string()),
        };

        Ok(ResolvedConfig {
            charon,
            tracking_db_path: config.database.record_tracking_db_path,
            top_dir: config.analysis.top_dir,
            executor,
            slurm,
            best_practice_workflows,
            sarek,
            qc,
            mail,
            organize,
        })
    }
}

pub fn default_best_practice_workflows() -> BTreeMap<String, String> {
    [
        ("wgs_germline", "sarek_germline"),
        ("exome_germline", "sarek_germline"),
        ("wgs_somatic", "sarek_somatic"),
        ("qc", "qc"),
    ]
    .into_iter()
    .map(|(label, workflow)| (label.to_string(), workflow.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            charon: CharonSection {
                base_url: Some("https://charon.example.org/".to_string()),
                ..CharonSection::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let resolved = ConfigLoader::resolve_config_with_env(minimal(), |_| None).unwrap();
        assert_eq!(resolved.charon.base_url, "https://charon.example.org");
        assert_eq!(resolved.charon.timeout, Duration::from_secs(30));
        assert_eq!(resolved.executor, ExecutorKind::Local);
        assert_eq!(resolved.slurm.partition, "core");
        assert_eq!(resolved.slurm.time, "48:00:00");
        assert!(!resolved.organize.project_id_fallback);
        assert_eq!(
            resolved.best_practice_workflows.get("wgs_germline").map(String::as_str),
            Some("sarek_germline")
        );
        assert!(resolved.tracking_db_path().is_err());
    }

    #[test]
    fn environment_overrides_charon_settings() {
        let resolved = ConfigLoader::resolve_config_with_env(minimal(), |name| match name {
            CHARON_BASE_URL_ENV => Some("http://localhost:5000".to_string()),
            CHARON_API_TOKEN_ENV => Some("secret".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(resolved.charon.base_url, "http://localhost:5000");
        assert_eq!(resolved.charon.api_token.as_deref(), Some("secret"));
    }

    #[test]
    fn slurm_requires_account() {
        let mut config = minimal();
        config.environment.executor = Some(ExecutorKind::Slurm);
        let err = ConfigLoader::resolve_config_with_env(config, |_| None).unwrap_err();
        assert!(matches!(err, ConductorError::MissingConfigKey(key) if key == "environment.project_id"));
    }
}
