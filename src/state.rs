use std::fmt;
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StudyError;
use crate::git::GitPlumbing;
use crate::planner::LinkRecord;

pub const DESCRIPTION_FILE: &str = "dataset_description.json";
pub const VALIDATION_MARKER: &str = "derivatives/bids-validator.json";
const METADATA_KEY: &str = "SourceDatasets";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyState {
    Discovered,
    Organized,
    MetadataGenerated,
    Validated,
}

impl StudyState {
    pub fn next(self) -> Option<Self> {
        match self {
            StudyState::Discovered => Some(StudyState::Organized),
            StudyState::Organized => Some(StudyState::MetadataGenerated),
            StudyState::MetadataGenerated => Some(StudyState::Validated),
            StudyState::Validated => None,
        }
    }
}

impl fmt::Display for StudyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StudyState::Discovered => write!(f, "discovered"),
            StudyState::Organized => write!(f, "organized"),
            StudyState::MetadataGenerated => write!(f, "metadata_generated"),
            StudyState::Validated => write!(f, "validated"),
        }
    }
}

/// Accepts staying put or moving exactly one stage forward.
pub fn check_transition(from: StudyState, to: StudyState) -> Result<(), StudyError> {
    if from == to || from.next() == Some(to) {
        return Ok(());
    }
    Err(StudyError::StateTransition(format!("{from} -> {to}")))
}

/// Guards the link step of a study. Only the linked stage is compared, since
/// later markers belong to other tools and may already be on disk.
pub fn check_linked(before: StudyState, after: StudyState) -> Result<(), StudyError> {
    let from = before.min(StudyState::Organized);
    let to = after.min(StudyState::Organized);
    check_transition(from, to)?;
    if to < StudyState::Organized {
        return Err(StudyError::StateTransition(format!(
            "{before} -> {after}: links missing after commit"
        )));
    }
    Ok(())
}

/// Derives lifecycle stages from what is on disk. Nothing is cached.
pub struct StateTracker<'a, G: GitPlumbing> {
    git: &'a G,
}

impl<'a, G: GitPlumbing> StateTracker<'a, G> {
    pub fn new(git: &'a G) -> Self {
        Self { git }
    }

    pub fn derive(
        &self,
        study_dir: &Utf8Path,
        expected: &[LinkRecord],
    ) -> Result<StudyState, StudyError> {
        if expected.is_empty() || !self.git.is_repository(study_dir) {
            return Ok(StudyState::Discovered);
        }
        let manifest = self.git.read_manifest(study_dir)?;
        let complete = expected.iter().all(|record| {
            manifest
                .get(&record.path)
                .is_some_and(|entry| entry.matches(record))
        });
        if !complete {
            debug!(study = %study_dir, "links incomplete");
            return Ok(StudyState::Discovered);
        }
        if !has_metadata(study_dir) {
            return Ok(StudyState::Organized);
        }
        if !study_dir.join(VALIDATION_MARKER).as_std_path().is_file() {
            return Ok(StudyState::MetadataGenerated);
        }
        Ok(StudyState::Validated)
    }
}

fn has_metadata(study_dir: &Utf8Path) -> bool {
    let path = study_dir.join(DESCRIPTION_FILE);
    let Ok(content) = fs::read_to_string(path.as_std_path()) else {
        return false;
    };
    match serde_json::from_str::<serde_json::Value>(&content) {
        Ok(value) => value.get(METADATA_KEY).is_some(),
        Err(err) => {
            debug!(path = %path, error = %err, "unreadable dataset description");
            false
        }
    }
}
