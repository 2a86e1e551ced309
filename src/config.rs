use std::fs;
use std::io;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::domain::StudyId;
use crate::error::StudyError;
use crate::git::CommitIdentity;

const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_GITHUB_ORG: &str = "OpenNeuroStudies";
pub const DEFAULT_COMMITTER_NAME: &str = "study-org";
pub const DEFAULT_COMMITTER_EMAIL: &str = "study-org@localhost";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub github_org: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub allow_relink: Option<bool>,
    #[serde(default)]
    pub committer: Option<CommitterEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CommitterEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub github_org: String,
    pub workers: usize,
    pub allow_relink: bool,
    pub committer: CommitIdentity,
}

impl ResolvedConfig {
    /// Published location of a study repository.
    pub fn study_url(&self, study: &StudyId) -> String {
        format!("https://github.com/{}/{study}", self.github_org)
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            github_org: DEFAULT_GITHUB_ORG.to_string(),
            workers: default_workers(),
            allow_relink: false,
            committer: CommitIdentity {
                name: DEFAULT_COMMITTER_NAME.to_string(),
                email: DEFAULT_COMMITTER_EMAIL.to_string(),
            },
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `explicit` when given (it must exist), otherwise `default_path`
    /// if present, otherwise built-in defaults.
    pub fn resolve(
        explicit: Option<&Utf8Path>,
        default_path: &Utf8Path,
    ) -> Result<ResolvedConfig, StudyError> {
        let config_path = explicit.unwrap_or(default_path);
        let content = match fs::read_to_string(config_path.as_std_path()) {
            Ok(content) => content,
            Err(err) if explicit.is_none() && err.kind() == io::ErrorKind::NotFound => {
                return Self::resolve_config(Config::default());
            }
            Err(_) => return Err(StudyError::ConfigRead(config_path.to_owned())),
        };
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| StudyError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, StudyError> {
        let schema_version = config.schema_version.unwrap_or(SCHEMA_VERSION);
        if schema_version != SCHEMA_VERSION {
            return Err(StudyError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let github_org = config
            .github_org
            .map(|org| org.trim().to_string())
            .unwrap_or_else(|| DEFAULT_GITHUB_ORG.to_string());
        if github_org.is_empty()
            || github_org.contains('/')
            || github_org.chars().any(char::is_whitespace)
        {
            return Err(StudyError::InvalidConfig(format!(
                "github_org must be a bare organization name, got {github_org:?}"
            )));
        }

        let workers = match config.workers {
            Some(0) => {
                return Err(StudyError::InvalidConfig(
                    "workers must be at least 1".to_string(),
                ));
            }
            Some(workers) => workers,
            None => default_workers(),
        };

        let committer = config.committer.unwrap_or_default();
        let committer = CommitIdentity {
            name: non_empty(committer.name, DEFAULT_COMMITTER_NAME),
            email: non_empty(committer.email, DEFAULT_COMMITTER_EMAIL),
        };

        Ok(ResolvedConfig {
            schema_version,
            github_org,
            workers,
            allow_relink: config.allow_relink.unwrap_or(false),
            committer,
        })
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

fn non_empty(value: Option<String>, fallback: &str) -> String {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
