use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{DatasetDescriptor, DatasetId};
use crate::error::StudyError;

/// On-disk shape of the discovery collaborator's output.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DiscoveredFile {
    #[serde(default)]
    pub datasets: Vec<DatasetDescriptor>,
}

/// Id-indexed descriptor set for one run.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    descriptors: BTreeMap<DatasetId, DatasetDescriptor>,
}

impl Catalog {
    pub fn new(descriptors: impl IntoIterator<Item = DatasetDescriptor>) -> Self {
        let mut sorted = descriptors.into_iter().collect::<Vec<_>>();
        sorted.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.revision.cmp(&b.revision)));

        let mut map: BTreeMap<DatasetId, DatasetDescriptor> = BTreeMap::new();
        for descriptor in sorted {
            if let Some(kept) = map.get(&descriptor.id) {
                if kept != &descriptor {
                    warn!(
                        dataset = %descriptor.id,
                        kept = %kept.revision,
                        dropped = %descriptor.revision,
                        "duplicate descriptor id; keeping the first revision"
                    );
                }
                continue;
            }
            map.insert(descriptor.id.clone(), descriptor);
        }
        Self { descriptors: map }
    }

    pub fn load(path: &Utf8Path) -> Result<Self, StudyError> {
        let content =
            fs::read_to_string(path.as_std_path()).map_err(|err| StudyError::DescriptorRead {
                path: path.to_owned(),
                message: err.to_string(),
            })?;
        let file: DiscoveredFile =
            serde_json::from_str(&content).map_err(|err| StudyError::DescriptorRead {
                path: path.to_owned(),
                message: err.to_string(),
            })?;
        Ok(Self::new(file.datasets))
    }

    pub fn get(&self, id: &DatasetId) -> Option<&DatasetDescriptor> {
        self.descriptors.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatasetDescriptor> {
        self.descriptors.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Revision;

    fn rev(ch: char) -> Revision {
        ch.to_string().repeat(40).parse().unwrap()
    }

    #[test]
    fn duplicates_collapse_to_lowest_revision() {
        let id: DatasetId = "ds1".parse().unwrap();
        let catalog = Catalog::new(vec![
            DatasetDescriptor::raw(id.clone(), "https://example.org/ds1", rev('b')),
            DatasetDescriptor::raw(id.clone(), "https://example.org/ds1", rev('a')),
        ]);
        assert_eq!(catalog.iter().count(), 1);
        assert_eq!(catalog.get(&id).unwrap().revision, rev('a'));
    }

    #[test]
    fn load_rejects_symbolic_revisions() {
        let temp = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(temp.path().join("d.json")).unwrap();
        std::fs::write(
            path.as_std_path(),
            r#"{"datasets":[{"id":"ds1","source_url":"u","revision":"HEAD","kind":"raw"}]}"#,
        )
        .unwrap();
        let err = Catalog::load(&path).unwrap_err();
        assert!(matches!(err, StudyError::DescriptorRead { .. }));
    }
}
