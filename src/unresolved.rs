//! Durable record of derivatives that could not be organized.
//!
//! The registry is rebuilt from the current classification on every run:
//! entries whose gap closed disappear, new ones appear, and surviving ones
//! keep their `first_seen` timestamp.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classify::{Rejection, UnresolvedReason};
use crate::domain::DatasetId;
use crate::error::StudyError;
use crate::store::write_bytes_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedEntry {
    pub derivative_id: DatasetId,
    pub declared_source_ids: Vec<String>,
    pub missing_source_ids: Vec<String>,
    pub reason: UnresolvedReason,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    unresolved: Vec<UnresolvedEntry>,
    #[serde(default)]
    count: usize,
    #[serde(default)]
    by_reason: BTreeMap<UnresolvedReason, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: Vec<DatasetId>,
    pub removed: Vec<DatasetId>,
    pub retained: Vec<DatasetId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnresolvedRegistry {
    entries: BTreeMap<DatasetId, UnresolvedEntry>,
}

impl UnresolvedRegistry {
    /// Reads the registry file; a missing file is an empty registry.
    pub fn load(path: &Utf8Path) -> Result<Self, StudyError> {
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(StudyError::RegistryRead(format!("{path}: {err}"))),
        };
        let file: RegistryFile = serde_json::from_str(&content)
            .map_err(|err| StudyError::RegistryRead(format!("{path}: {err}")))?;
        let entries = file
            .unresolved
            .into_iter()
            .map(|entry| (entry.derivative_id.clone(), entry))
            .collect();
        Ok(Self { entries })
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), StudyError> {
        let file = RegistryFile {
            unresolved: self.entries.values().cloned().collect(),
            count: self.entries.len(),
            by_reason: self.summary_by_reason(),
        };
        let mut content = serde_json::to_vec_pretty(&file)
            .map_err(|err| StudyError::Filesystem(err.to_string()))?;
        content.push(b'\n');
        write_bytes_atomic(path, &content)
    }

    pub fn reconcile(&mut self, rejected: &[Rejection], now: DateTime<Utc>) -> ReconcileReport {
        let current = rejected
            .iter()
            .map(|rejection| &rejection.derivative_id)
            .collect::<BTreeSet<_>>();

        let mut report = ReconcileReport::default();
        self.entries.retain(|id, _| {
            let keep = current.contains(id);
            if !keep {
                report.removed.push(id.clone());
            }
            keep
        });

        for rejection in rejected {
            match self.entries.get_mut(&rejection.derivative_id) {
                Some(entry) => {
                    entry.declared_source_ids = rejection.declared_source_ids.clone();
                    entry.missing_source_ids = rejection.missing_source_ids.clone();
                    entry.reason = rejection.reason;
                    entry.last_seen = now;
                    report.retained.push(rejection.derivative_id.clone());
                }
                None => {
                    self.entries.insert(
                        rejection.derivative_id.clone(),
                        UnresolvedEntry {
                            derivative_id: rejection.derivative_id.clone(),
                            declared_source_ids: rejection.declared_source_ids.clone(),
                            missing_source_ids: rejection.missing_source_ids.clone(),
                            reason: rejection.reason,
                            first_seen: now,
                            last_seen: now,
                        },
                    );
                    report.added.push(rejection.derivative_id.clone());
                }
            }
        }

        info!(
            added = report.added.len(),
            removed = report.removed.len(),
            retained = report.retained.len(),
            "reconciled unresolved registry"
        );
        report
    }

    pub fn get(&self, id: &DatasetId) -> Option<&UnresolvedEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &UnresolvedEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary_by_reason(&self) -> BTreeMap<UnresolvedReason, usize> {
        let mut summary = BTreeMap::new();
        for entry in self.entries.values() {
            *summary.entry(entry.reason).or_insert(0) += 1;
        }
        summary
    }
}
