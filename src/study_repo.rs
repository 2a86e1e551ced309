use camino::Utf8Path;
use serde::Serialize;
use tracing::info;

use crate::domain::StudyId;
use crate::error::StudyError;
use crate::git::GitPlumbing;
use crate::state::DESCRIPTION_FILE;
use crate::store::write_json_atomic;

const BIDS_VERSION: &str = "1.10.1";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StudyDescription<'a> {
    name: String,
    #[serde(rename = "BIDSVersion")]
    bids_version: &'a str,
    dataset_type: &'a str,
    license: &'a str,
    authors: Vec<String>,
    references_and_links: Vec<String>,
}

/// Makes sure `dir` is a study repository, creating it with an initial
/// description commit when absent. Returns whether it was created.
pub fn ensure_study_repository<G: GitPlumbing>(
    git: &G,
    dir: &Utf8Path,
    study: &StudyId,
    study_url: &str,
    authors: &str,
) -> Result<bool, StudyError> {
    if git.is_repository(dir) {
        return Ok(false);
    }
    if dir.as_std_path().exists() {
        return Err(StudyError::StudyRepository {
            path: dir.to_owned(),
            message: "exists but is not a repository".to_string(),
        });
    }

    git.init_repository(dir)?;
    let description = StudyDescription {
        name: format!("Study dataset for {study}"),
        bids_version: BIDS_VERSION,
        dataset_type: "study",
        license: "CC0",
        authors: vec![authors.to_string()],
        references_and_links: vec![
            "https://openneuro.org".to_string(),
            study_url.to_string(),
            "https://bids.neuroimaging.io/extensions/beps/bep_035.html".to_string(),
        ],
    };
    write_json_atomic(&dir.join(DESCRIPTION_FILE), &description)?;
    git.stage_file(dir, DESCRIPTION_FILE)?;
    git.commit(dir, &format!("Initialize {study} study dataset"))?;
    info!(study = %study, path = %dir, "created study repository");
    Ok(true)
}
