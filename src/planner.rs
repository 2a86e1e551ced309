use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::domain::{DatasetDescriptor, DatasetId, Revision, StudyId, StudyPlan};
use crate::error::StudyError;

pub const SOURCE_DIR: &str = "sourcedata";
pub const DERIVATIVE_DIR: &str = "derivatives";

const INSTANCE_PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub path: String,
    pub name: String,
    pub source_url: String,
    pub revision: Revision,
    /// Written as `datalad-id` so the content can be fetched on demand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl fmt::Display for LinkRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} @ {}", self.path, self.source_url, self.revision.short())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Source,
    Derivative,
    /// Points at a study repository managed by this crate; may move forward.
    Study,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedLink {
    pub kind: LinkKind,
    #[serde(flatten)]
    pub record: LinkRecord,
}

/// Where a study repository is published and which revision it is at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyRef {
    pub source_url: String,
    pub revision: Revision,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkPlan {
    pub links: Vec<PlannedLink>,
    /// Linked studies whose revision is not known yet.
    pub pending_studies: Vec<StudyId>,
}

impl LinkPlan {
    pub fn records(&self) -> Vec<LinkRecord> {
        self.links.iter().map(|link| link.record.clone()).collect()
    }
}

/// Produces the ordered links for one study: sources, derivatives, then
/// linked studies. Performs no I/O.
pub fn plan_links(
    plan: &StudyPlan,
    catalog: &Catalog,
    studies: &BTreeMap<StudyId, StudyRef>,
) -> Result<LinkPlan, StudyError> {
    plan.validate(|id| catalog.get(id))?;

    let lookup = |id: &DatasetId| {
        catalog.get(id).ok_or_else(|| StudyError::InvalidPlan {
            study: plan.study_id.to_string(),
            message: format!("dataset {id} is not in the descriptor set"),
        })
    };

    let mut links = Vec::new();
    for member in &plan.member_source_ids {
        let descriptor = lookup(member)?;
        let path = format!("{SOURCE_DIR}/{}", sanitize_component(member.as_str()));
        links.push(planned(LinkKind::Source, path, descriptor));
    }

    let derivatives = plan
        .derivative_ids
        .iter()
        .map(lookup)
        .collect::<Result<Vec<_>, _>>()?;
    for (descriptor, slot) in derivatives.iter().zip(derivative_slots(&derivatives)) {
        let path = format!("{DERIVATIVE_DIR}/{slot}");
        links.push(planned(LinkKind::Derivative, path, descriptor));
    }

    let mut pending_studies = Vec::new();
    for linked in &plan.linked_studies {
        match studies.get(linked) {
            Some(study_ref) => {
                let path = format!("{DERIVATIVE_DIR}/{linked}");
                links.push(PlannedLink {
                    kind: LinkKind::Study,
                    record: LinkRecord {
                        name: link_name(&path),
                        path,
                        source_url: study_ref.source_url.clone(),
                        revision: study_ref.revision.clone(),
                        instance_id: None,
                    },
                });
            }
            None => pending_studies.push(linked.clone()),
        }
    }

    ensure_unique(plan, &links)?;
    Ok(LinkPlan {
        links,
        pending_studies,
    })
}

pub fn link_name(path: &str) -> String {
    path.replace('/', "-")
}

fn planned(kind: LinkKind, path: String, descriptor: &DatasetDescriptor) -> PlannedLink {
    PlannedLink {
        kind,
        record: LinkRecord {
            name: link_name(&path),
            path,
            source_url: descriptor.source_url.clone(),
            revision: descriptor.revision.clone(),
            instance_id: descriptor.instance_id.clone(),
        },
    }
}

/// Directory names for derivatives, in input order. Names shared by more than
/// one derivative get a suffix from each one's instance id (or dataset id when
/// the instance ids cannot tell them apart).
fn derivative_slots(derivatives: &[&DatasetDescriptor]) -> Vec<String> {
    let bases = derivatives
        .iter()
        .map(|descriptor| base_slot(descriptor))
        .collect::<Vec<_>>();

    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, base) in bases.iter().enumerate() {
        groups.entry(base.as_str()).or_default().push(index);
    }

    let mut slots = bases.clone();
    for indexes in groups.values().filter(|indexes| indexes.len() > 1) {
        let prefixes = indexes
            .iter()
            .map(|&index| instance_prefix(derivatives[index]))
            .collect::<Vec<_>>();
        let distinct = prefixes.iter().flatten().collect::<BTreeSet<_>>().len();
        let usable = prefixes.iter().all(Option::is_some) && distinct == prefixes.len();

        for (position, &index) in indexes.iter().enumerate() {
            let suffix = match (&prefixes[position], usable) {
                (Some(prefix), true) => prefix.clone(),
                _ => sanitize_component(derivatives[index].id.as_str()),
            };
            slots[index] = format!("{}-{suffix}", bases[index]);
        }
    }
    slots
}

fn base_slot(descriptor: &DatasetDescriptor) -> String {
    let tool = descriptor
        .tool_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let version = descriptor
        .tool_version
        .as_deref()
        .map(str::trim)
        .filter(|version| !version.is_empty());
    match (tool, version) {
        (Some(tool), Some(version)) => sanitize_component(&format!("{tool}-{version}")),
        (Some(tool), None) => sanitize_component(tool),
        _ => sanitize_component(descriptor.id.as_str()),
    }
}

fn instance_prefix(descriptor: &DatasetDescriptor) -> Option<String> {
    let prefix = descriptor
        .instance_id
        .as_deref()?
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(INSTANCE_PREFIX_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    (prefix.len() == INSTANCE_PREFIX_LEN).then_some(prefix)
}

fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '+' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn ensure_unique(plan: &StudyPlan, links: &[PlannedLink]) -> Result<(), StudyError> {
    let mut paths = BTreeSet::new();
    let mut names = BTreeSet::new();
    for link in links {
        if !paths.insert(link.record.path.as_str()) || !names.insert(link.record.name.as_str()) {
            return Err(StudyError::InvalidPlan {
                study: plan.study_id.to_string(),
                message: format!("duplicate link slot {}", link.record.path),
            });
        }
    }
    Ok(())
}
