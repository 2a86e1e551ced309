use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StudyError;

pub const STUDY_PREFIX: &str = "study-";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = StudyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && !normalized.starts_with('.')
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(StudyError::InvalidDatasetId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for DatasetId {
    type Error = StudyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatasetId> for String {
    fn from(value: DatasetId) -> Self {
        value.0
    }
}

/// Full hex object id of a commit. Abbreviated and symbolic names are refused
/// so that every link is pinned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision(String);

impl Revision {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Revision {
    type Err = StudyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        let is_valid = matches!(normalized.len(), 40 | 64)
            && normalized.chars().all(|ch| ch.is_ascii_hexdigit());
        if !is_valid {
            return Err(StudyError::InvalidRevision(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for Revision {
    type Error = StudyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Revision> for String {
    fn from(value: Revision) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StudyId(String);

impl StudyId {
    /// Study identity is a function of the sorted member set only.
    pub fn for_members(members: &BTreeSet<DatasetId>) -> Self {
        let joined = members
            .iter()
            .map(DatasetId::as_str)
            .collect::<Vec<_>>()
            .join("+");
        Self(format!("{STUDY_PREFIX}{joined}"))
    }

    pub fn for_dataset(id: &DatasetId) -> Self {
        Self(format!("{STUDY_PREFIX}{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StudyId {
    type Err = StudyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let rest = trimmed
            .strip_prefix(STUDY_PREFIX)
            .ok_or_else(|| StudyError::InvalidStudyId(value.to_string()))?;
        let members = rest
            .split('+')
            .map(|part| {
                part.parse::<DatasetId>()
                    .map_err(|_| StudyError::InvalidStudyId(value.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if members.is_empty() {
            return Err(StudyError::InvalidStudyId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for StudyId {
    type Error = StudyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StudyId> for String {
    fn from(value: StudyId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Raw,
    Derivative,
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::Raw => write!(f, "raw"),
            DatasetKind::Derivative => write!(f, "derivative"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub id: DatasetId,
    pub source_url: String,
    pub revision: Revision,
    pub kind: DatasetKind,
    /// Kept as reported by discovery; parsed during classification.
    #[serde(default)]
    pub declared_source_ids: Vec<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_version: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl DatasetDescriptor {
    pub fn raw(id: DatasetId, source_url: impl Into<String>, revision: Revision) -> Self {
        Self {
            id,
            source_url: source_url.into(),
            revision,
            kind: DatasetKind::Raw,
            declared_source_ids: Vec::new(),
            tool_name: None,
            tool_version: None,
            instance_id: None,
        }
    }

    pub fn derivative(
        id: DatasetId,
        source_url: impl Into<String>,
        revision: Revision,
        declared_source_ids: Vec<String>,
    ) -> Self {
        Self {
            id,
            source_url: source_url.into(),
            revision,
            kind: DatasetKind::Derivative,
            declared_source_ids,
            tool_name: None,
            tool_version: None,
            instance_id: None,
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self.tool_version = Some(version.into());
        self
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyPlan {
    pub study_id: StudyId,
    pub member_source_ids: BTreeSet<DatasetId>,
    pub derivative_ids: BTreeSet<DatasetId>,
    /// Studies registered as derivative links inside this one.
    pub linked_studies: BTreeSet<StudyId>,
}

impl StudyPlan {
    pub fn new(members: BTreeSet<DatasetId>) -> Self {
        Self {
            study_id: StudyId::for_members(&members),
            member_source_ids: members,
            derivative_ids: BTreeSet::new(),
            linked_studies: BTreeSet::new(),
        }
    }

    /// Checks that the plan has members and that every derivative's declared
    /// sources are among them.
    pub fn validate<'a>(
        &self,
        lookup: impl Fn(&DatasetId) -> Option<&'a DatasetDescriptor>,
    ) -> Result<(), StudyError> {
        if self.member_source_ids.is_empty() {
            return Err(StudyError::InvalidPlan {
                study: self.study_id.to_string(),
                message: "study has no member sources".to_string(),
            });
        }
        for derivative_id in &self.derivative_ids {
            let descriptor = lookup(derivative_id).ok_or_else(|| StudyError::InvalidPlan {
                study: self.study_id.to_string(),
                message: format!("unknown derivative {derivative_id}"),
            })?;
            let outside = descriptor
                .declared_source_ids
                .iter()
                .filter(|declared| {
                    !self
                        .member_source_ids
                        .iter()
                        .any(|member| member.as_str() == declared.trim())
                })
                .cloned()
                .collect::<Vec<_>>();
            if !outside.is_empty() {
                return Err(StudyError::InvalidPlan {
                    study: self.study_id.to_string(),
                    message: format!(
                        "derivative {derivative_id} declares sources outside the study: {}",
                        outside.join(", ")
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_dataset_id_valid() {
        let id: DatasetId = " ds000001 ".parse().unwrap();
        assert_eq!(id.as_str(), "ds000001");
    }

    #[test]
    fn parse_dataset_id_invalid() {
        let err = "ds/001".parse::<DatasetId>().unwrap_err();
        assert_matches!(err, StudyError::InvalidDatasetId(_));
        assert!("".parse::<DatasetId>().is_err());
        assert!(".hidden".parse::<DatasetId>().is_err());
    }

    #[test]
    fn parse_revision_rejects_symbolic() {
        let err = "HEAD".parse::<Revision>().unwrap_err();
        assert_matches!(err, StudyError::InvalidRevision(_));
        let rev: Revision = "F8E27AC909E50B5B5E311F6BE271F0B1757EBB7B".parse().unwrap();
        assert_eq!(rev.short(), "f8e27ac9");
    }

    #[test]
    fn study_id_is_order_independent() {
        let a: DatasetId = "dsA".parse().unwrap();
        let b: DatasetId = "dsB".parse().unwrap();
        let first = StudyId::for_members(&[b.clone(), a.clone()].into_iter().collect());
        let second = StudyId::for_members(&[a, b].into_iter().collect());
        assert_eq!(first, second);
        assert_eq!(first.as_str(), "study-dsA+dsB");
    }

    #[test]
    fn parse_study_id() {
        let id: StudyId = "study-ds1+ds2".parse().unwrap();
        assert_eq!(id.as_str(), "study-ds1+ds2");
        assert_matches!(
            "ds1".parse::<StudyId>().unwrap_err(),
            StudyError::InvalidStudyId(_)
        );
    }
}
