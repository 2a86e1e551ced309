use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum StudyError {
    #[error("invalid dataset id: {0}")]
    InvalidDatasetId(String),

    #[error("invalid study id: {0}")]
    InvalidStudyId(String),

    #[error("invalid revision (expected a full hex object id): {0}")]
    InvalidRevision(String),

    #[error("invalid target pattern: {0}")]
    InvalidTarget(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read descriptors from {path}: {message}")]
    DescriptorRead { path: Utf8PathBuf, message: String },

    #[error("failed to read unresolved registry: {0}")]
    RegistryRead(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    #[error("top-level target {path} is not a usable repository: {message}")]
    #[diagnostic(help("run `git init` in the top-level directory first"))]
    RepositoryInitialization { path: Utf8PathBuf, message: String },

    #[error("study repository {path} is unusable: {message}")]
    StudyRepository { path: Utf8PathBuf, message: String },

    #[error("link conflict at {path}: existing {existing}, proposed {proposed}")]
    #[diagnostic(help("re-run with --allow-relink to move the link"))]
    LinkConflict {
        path: String,
        existing: String,
        proposed: String,
    },

    #[error("invalid link plan for {study}: {message}")]
    InvalidPlan { study: String, message: String },

    #[error("state transition violated: {0}")]
    StateTransition(String),

    #[error("all {count} studies failed: {}", study_ids.join(", "))]
    AllStudiesFailed { count: usize, study_ids: Vec<String> },
}
