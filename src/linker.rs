use std::fs;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::Revision;
use crate::error::StudyError;
use crate::git::{GitPlumbing, Manifest, ManifestEntry};
use crate::planner::{LinkKind, LinkRecord, PlannedLink};

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkOptions {
    /// Move dataset links whose source or revision changed instead of failing.
    pub allow_relink: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkOutcome {
    pub added: Vec<LinkRecord>,
    pub updated: Vec<LinkRecord>,
    pub unchanged: usize,
    pub commit: Option<Revision>,
    /// Paths in the manifest that the planned links no longer cover.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stale: Vec<String>,
}

impl LinkOutcome {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Keep,
    Add,
    Update,
}

pub struct Linker<'a, G: GitPlumbing> {
    git: &'a G,
}

impl<'a, G: GitPlumbing> Linker<'a, G> {
    pub fn new(git: &'a G) -> Self {
        Self { git }
    }

    /// Stages every link that is missing or has moved, in order. Conflicts are
    /// detected before anything is staged. On failure the caller decides
    /// whether to discard what was staged.
    pub fn stage(
        &self,
        repo: &Utf8Path,
        links: &[PlannedLink],
        options: LinkOptions,
    ) -> Result<LinkOutcome, StudyError> {
        let manifest = self.manifest(repo)?;
        self.stage_against(repo, &manifest, links, options)
    }

    fn stage_against(
        &self,
        repo: &Utf8Path,
        manifest: &Manifest,
        links: &[PlannedLink],
        options: LinkOptions,
    ) -> Result<LinkOutcome, StudyError> {
        let actions = decide_all(manifest, links, options)?;

        let mut outcome = LinkOutcome::default();
        for (link, action) in links.iter().zip(actions) {
            if action == Action::Keep {
                outcome.unchanged += 1;
                continue;
            }
            self.stage_one(repo, &link.record)?;
            debug!(repo = %repo, link = %link.record, ?action, "staged link");
            match action {
                Action::Add => outcome.added.push(link.record.clone()),
                Action::Update => outcome.updated.push(link.record.clone()),
                Action::Keep => {}
            }
        }
        Ok(outcome)
    }

    /// Reports what [`Linker::link`] would do without touching the repository.
    pub fn preview(
        &self,
        repo: &Utf8Path,
        links: &[PlannedLink],
        options: LinkOptions,
    ) -> Result<LinkOutcome, StudyError> {
        let manifest = self.manifest(repo)?;
        let mut outcome = LinkOutcome {
            stale: stale_paths(&manifest, links),
            ..LinkOutcome::default()
        };
        for (link, action) in links.iter().zip(decide_all(&manifest, links, options)?) {
            match action {
                Action::Keep => outcome.unchanged += 1,
                Action::Add => outcome.added.push(link.record.clone()),
                Action::Update => outcome.updated.push(link.record.clone()),
            }
        }
        Ok(outcome)
    }

    /// Stages the links and commits them as one change. Nothing is committed
    /// when every link is already in place; any failure discards the batch.
    /// Manifest entries outside `links` are reported as stale, never removed.
    pub fn link(
        &self,
        repo: &Utf8Path,
        label: &str,
        links: &[PlannedLink],
        options: LinkOptions,
    ) -> Result<LinkOutcome, StudyError> {
        let manifest = self.manifest(repo)?;
        let mut outcome = match self.stage_against(repo, &manifest, links, options) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.rollback(repo);
                return Err(err);
            }
        };
        outcome.stale = stale_paths(&manifest, links);
        for path in &outcome.stale {
            warn!(repo = %repo, path = %path, "link no longer planned");
        }
        if !outcome.changed() {
            return Ok(outcome);
        }
        let message = commit_message(label, &outcome);
        match self.git.commit(repo, &message) {
            Ok(revision) => {
                info!(
                    repo = %repo,
                    added = outcome.added.len(),
                    updated = outcome.updated.len(),
                    commit = %revision.short(),
                    "linked"
                );
                outcome.commit = Some(revision);
                Ok(outcome)
            }
            Err(err) => {
                self.rollback(repo);
                Err(err)
            }
        }
    }

    fn manifest(&self, repo: &Utf8Path) -> Result<Manifest, StudyError> {
        if self.git.is_repository(repo) {
            self.git.read_manifest(repo)
        } else {
            Ok(Manifest::new())
        }
    }

    fn stage_one(&self, repo: &Utf8Path, record: &LinkRecord) -> Result<(), StudyError> {
        // Empty placeholder so status tooling does not report the path deleted.
        let placeholder = repo.join(&record.path);
        fs::create_dir_all(placeholder.as_std_path())
            .map_err(|err| StudyError::Filesystem(format!("create {placeholder}: {err}")))?;
        self.git.stage_link(repo, record)
    }

    fn rollback(&self, repo: &Utf8Path) {
        if let Err(err) = self.git.discard_staged(repo) {
            warn!(repo = %repo, error = %err, "failed to discard staged links");
        }
    }
}

fn decide_all(
    manifest: &Manifest,
    links: &[PlannedLink],
    options: LinkOptions,
) -> Result<Vec<Action>, StudyError> {
    links
        .iter()
        .map(|link| decide(manifest, link, options))
        .collect()
}

fn stale_paths(manifest: &Manifest, links: &[PlannedLink]) -> Vec<String> {
    manifest
        .keys()
        .filter(|path| !links.iter().any(|link| &link.record.path == *path))
        .cloned()
        .collect()
}

fn decide(
    manifest: &Manifest,
    link: &PlannedLink,
    options: LinkOptions,
) -> Result<Action, StudyError> {
    let record = &link.record;
    if let Some(other) = manifest
        .values()
        .find(|entry| entry.name == record.name && entry.path != record.path)
    {
        return Err(StudyError::LinkConflict {
            path: record.path.clone(),
            existing: format!("name {} bound to {}", other.name, other.path),
            proposed: record.to_string(),
        });
    }

    let Some(existing) = manifest.get(&record.path) else {
        return Ok(Action::Add);
    };
    let instance_known = record.instance_id.is_none() || existing.instance_id == record.instance_id;
    if existing.matches(record) && existing.name == record.name && instance_known {
        return Ok(Action::Keep);
    }
    if !existing.name.is_empty() && existing.name != record.name {
        return Err(conflict(existing, record));
    }

    let url_differs = existing
        .source_url
        .as_deref()
        .is_some_and(|url| url != record.source_url);
    let revision_differs = existing
        .revision
        .as_ref()
        .is_some_and(|revision| revision != &record.revision);
    if url_differs || revision_differs {
        if link.kind == LinkKind::Study || options.allow_relink {
            return Ok(Action::Update);
        }
        return Err(conflict(existing, record));
    }
    // Half-present entry (manifest without gitlink or the reverse).
    Ok(Action::Add)
}

fn conflict(existing: &ManifestEntry, record: &LinkRecord) -> StudyError {
    StudyError::LinkConflict {
        path: record.path.clone(),
        existing: existing.describe(),
        proposed: format!("{} @ {}", record.source_url, record.revision),
    }
}

fn commit_message(label: &str, outcome: &LinkOutcome) -> String {
    let total = outcome.added.len() + outcome.updated.len();
    let noun = if total == 1 { "link" } else { "links" };
    let mut message = format!(
        "Link {total} {noun} into {label}\n\n{} added, {} updated\n",
        outcome.added.len(),
        outcome.updated.len()
    );
    for record in &outcome.added {
        message.push_str(&format!("\n+ {record}"));
    }
    for record in &outcome.updated {
        message.push_str(&format!("\n~ {record}"));
    }
    message.push('\n');
    message
}
