//! Maps a descriptor set onto study groupings.
//!
//! Every raw dataset is wrapped by its own study. A derivative with a single
//! raw source is attached to that source's study; any other fully resolvable
//! derivative gets a study of its own whose members are exactly its declared
//! sources, and that study is cross-linked into each member's home study.
//! Derivatives that cannot be placed are returned as [`Rejection`]s.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::domain::{DatasetDescriptor, DatasetId, DatasetKind, StudyId, StudyPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    SourceNotFound,
    InvalidReference,
    MultiSourceIncomplete,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedReason::SourceNotFound => write!(f, "source_not_found"),
            UnresolvedReason::InvalidReference => write!(f, "invalid_reference"),
            UnresolvedReason::MultiSourceIncomplete => write!(f, "multi_source_incomplete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub derivative_id: DatasetId,
    pub declared_source_ids: Vec<String>,
    pub missing_source_ids: Vec<String>,
    pub reason: UnresolvedReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
    /// Linked as a derivative of an existing study.
    Attach(StudyId),
    /// Gets its own study; `hosts` are the members' home studies.
    Study {
        members: BTreeSet<DatasetId>,
        hosts: BTreeSet<StudyId>,
    },
}

impl Placement {
    fn home(&self) -> StudyId {
        match self {
            Placement::Attach(study) => study.clone(),
            Placement::Study { members, .. } => StudyId::for_members(members),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub plans: BTreeMap<StudyId, StudyPlan>,
    pub rejected: Vec<Rejection>,
}

impl Classification {
    pub fn plan(&self, study: &StudyId) -> Option<&StudyPlan> {
        self.plans.get(study)
    }

    pub fn study_ids(&self) -> impl Iterator<Item = &StudyId> {
        self.plans.keys()
    }
}

pub fn classify(catalog: &Catalog) -> Classification {
    let mut classifier = Classifier {
        catalog,
        memo: HashMap::new(),
    };

    let mut plans = BTreeMap::new();
    let mut placements = Vec::new();
    let mut rejected = Vec::new();
    for descriptor in catalog.iter() {
        match descriptor.kind {
            DatasetKind::Raw => {
                let plan = StudyPlan::new(BTreeSet::from([descriptor.id.clone()]));
                plans.insert(plan.study_id.clone(), plan);
            }
            DatasetKind::Derivative => match classifier.evaluate(&descriptor.id) {
                Ok(placement) => placements.push((descriptor.id.clone(), placement)),
                Err(rejection) => {
                    debug!(
                        dataset = %rejection.derivative_id,
                        reason = %rejection.reason,
                        "derivative rejected"
                    );
                    rejected.push(rejection);
                }
            },
        }
    }

    for (derivative_id, placement) in &placements {
        match placement {
            Placement::Attach(study) => match plans.get_mut(study) {
                Some(plan) => {
                    plan.derivative_ids.insert(derivative_id.clone());
                }
                None => warn!(dataset = %derivative_id, study = %study, "attach target missing"),
            },
            Placement::Study { members, .. } => {
                let study = StudyId::for_members(members);
                plans
                    .entry(study)
                    .or_insert_with(|| StudyPlan::new(members.clone()))
                    .derivative_ids
                    .insert(derivative_id.clone());
            }
        }
    }

    // Cross-links go in a second pass so every host plan already exists.
    for (derivative_id, placement) in &placements {
        if let Placement::Study { members, hosts } = placement {
            let study = StudyId::for_members(members);
            for host in hosts {
                match plans.get_mut(host) {
                    Some(plan) => {
                        plan.linked_studies.insert(study.clone());
                    }
                    None => warn!(dataset = %derivative_id, host = %host, "cross-link host missing"),
                }
            }
        }
    }

    Classification { plans, rejected }
}

struct Classifier<'a> {
    catalog: &'a Catalog,
    memo: HashMap<DatasetId, Result<Placement, Rejection>>,
}

impl<'a> Classifier<'a> {
    fn evaluate(&mut self, id: &DatasetId) -> Result<Placement, Rejection> {
        if let Some(cached) = self.memo.get(id) {
            return cached.clone();
        }
        let catalog = self.catalog;
        let Some(descriptor) = catalog.get(id) else {
            return Err(Rejection {
                derivative_id: id.clone(),
                declared_source_ids: Vec::new(),
                missing_source_ids: vec![id.to_string()],
                reason: UnresolvedReason::SourceNotFound,
            });
        };
        let result = self.place(descriptor);
        self.memo.insert(id.clone(), result.clone());
        result
    }

    fn place(&mut self, descriptor: &DatasetDescriptor) -> Result<Placement, Rejection> {
        let reject = |missing: Vec<String>, reason: UnresolvedReason| Rejection {
            derivative_id: descriptor.id.clone(),
            declared_source_ids: descriptor.declared_source_ids.clone(),
            missing_source_ids: missing,
            reason,
        };

        let Some(sources) = parse_sources(descriptor) else {
            return Err(reject(Vec::new(), UnresolvedReason::InvalidReference));
        };
        if sources.contains(&descriptor.id) || self.on_cycle(&descriptor.id) {
            return Err(reject(Vec::new(), UnresolvedReason::InvalidReference));
        }

        let mut missing = Vec::new();
        let mut hosts = BTreeSet::new();
        let mut single_raw = None;
        for source in &sources {
            match self.catalog.get(source).map(|found| found.kind) {
                None => missing.push(source.to_string()),
                Some(DatasetKind::Raw) => {
                    hosts.insert(StudyId::for_dataset(source));
                    single_raw = Some(source.clone());
                }
                Some(DatasetKind::Derivative) => match self.evaluate(source) {
                    Ok(placement) => {
                        hosts.insert(placement.home());
                    }
                    Err(_) => missing.push(source.to_string()),
                },
            }
        }

        if !missing.is_empty() {
            let reason = if sources.len() == 1 || missing.len() == sources.len() {
                UnresolvedReason::SourceNotFound
            } else {
                UnresolvedReason::MultiSourceIncomplete
            };
            return Err(reject(missing, reason));
        }

        match (sources.len(), single_raw) {
            (1, Some(raw)) => Ok(Placement::Attach(StudyId::for_dataset(&raw))),
            _ => Ok(Placement::Study {
                members: sources,
                hosts,
            }),
        }
    }

    /// True when `start` can reach itself through declared derivative sources.
    fn on_cycle(&self, start: &DatasetId) -> bool {
        let mut stack = self.derivative_sources(start);
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if &current == start {
                return true;
            }
            if seen.insert(current.clone()) {
                stack.extend(self.derivative_sources(&current));
            }
        }
        false
    }

    fn derivative_sources(&self, id: &DatasetId) -> Vec<DatasetId> {
        self.catalog
            .get(id)
            .and_then(|descriptor| match descriptor.kind {
                DatasetKind::Raw => None,
                DatasetKind::Derivative => parse_sources(descriptor),
            })
            .map(|sources| sources.into_iter().collect())
            .unwrap_or_default()
    }
}

fn parse_sources(descriptor: &DatasetDescriptor) -> Option<BTreeSet<DatasetId>> {
    if descriptor.declared_source_ids.is_empty() {
        return None;
    }
    descriptor
        .declared_source_ids
        .iter()
        .map(|raw| raw.parse::<DatasetId>().ok())
        .collect()
}
