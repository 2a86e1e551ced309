use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::Builder;

use crate::domain::StudyId;
use crate::error::StudyError;

pub const STATE_DIR: &str = ".study-org";
pub const CONFIG_FILE: &str = "study-org.json";
pub const DESCRIPTORS_FILE: &str = "discovered-datasets.json";
pub const REGISTRY_FILE: &str = "unresolved-datasets.json";

/// On-disk layout of a top-level repository: one directory per study at the
/// root, run state under `.study-org/`.
#[derive(Debug, Clone)]
pub struct Layout {
    root: Utf8PathBuf,
    state_dir: Utf8PathBuf,
}

impl Layout {
    pub fn new(root: Utf8PathBuf) -> Self {
        let state_dir = root.join(STATE_DIR);
        Self { root, state_dir }
    }

    pub fn current() -> Result<Self, StudyError> {
        let cwd = std::env::current_dir().map_err(|err| StudyError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(cwd)
            .map_err(|_| StudyError::Filesystem("invalid working directory path".to_string()))?;
        Ok(Self::new(root))
    }

    pub fn new_with_paths(root: Utf8PathBuf, state_dir: Utf8PathBuf) -> Self {
        Self { root, state_dir }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn state_dir(&self) -> &Utf8Path {
        &self.state_dir
    }

    pub fn study_dir(&self, study: &StudyId) -> Utf8PathBuf {
        self.root.join(study.as_str())
    }

    pub fn config_path(&self) -> Utf8PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn descriptors_path(&self) -> Utf8PathBuf {
        self.state_dir.join(DESCRIPTORS_FILE)
    }

    pub fn registry_path(&self) -> Utf8PathBuf {
        self.state_dir.join(REGISTRY_FILE)
    }
}

pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), StudyError> {
    let mut content =
        serde_json::to_vec_pretty(value).map_err(|err| StudyError::Filesystem(err.to_string()))?;
    content.push(b'\n');
    write_bytes_atomic(path, &content)
}

/// Writes through a sibling temp file and renames it over `path`.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), StudyError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| StudyError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".study-org-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| StudyError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| StudyError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| StudyError::Filesystem(format!("persist {path}: {}", err.error)))?;
    Ok(())
}
