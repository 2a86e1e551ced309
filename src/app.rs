use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::classify::{Classification, UnresolvedReason, classify};
use crate::config::ResolvedConfig;
use crate::domain::{Revision, StudyId, StudyPlan};
use crate::error::StudyError;
use crate::git::GitPlumbing;
use crate::linker::{LinkOptions, Linker};
use crate::planner::{LinkKind, LinkRecord, PlannedLink, StudyRef, plan_links};
use crate::state::{StateTracker, StudyState, check_linked};
use crate::store::Layout;
use crate::study_repo::ensure_study_repository;
use crate::unresolved::{ReconcileReport, UnresolvedEntry, UnresolvedRegistry};

#[derive(Debug, Clone, Default)]
pub struct OrganizeOptions {
    pub dry_run: bool,
    pub allow_relink: bool,
    /// Study id globs (`*`, `?`); empty means every study.
    pub targets: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

/// Stops new studies from starting; studies already running finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StudyOutcome {
    pub study_id: StudyId,
    pub state: StudyState,
    pub created: bool,
    pub added: Vec<LinkRecord>,
    pub updated: Vec<LinkRecord>,
    pub unchanged: usize,
    pub commit: Option<Revision>,
    pub pending_studies: Vec<StudyId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stale: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudyFailure {
    pub study_id: StudyId,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub organized_count: usize,
    pub unresolved_count: usize,
    pub failed_count: usize,
    pub failed_study_ids: Vec<StudyId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrganizeResult {
    pub dry_run: bool,
    pub organized: Vec<StudyOutcome>,
    pub unresolved: Vec<UnresolvedEntry>,
    pub reconcile: ReconcileReport,
    pub failed: Vec<StudyFailure>,
    pub skipped: Vec<StudyId>,
    pub top_level_commit: Option<Revision>,
    pub summary: RunSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub studies: Vec<StudyStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudyStatus {
    pub study_id: StudyId,
    pub state: StudyState,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedResult {
    pub count: usize,
    pub by_reason: BTreeMap<UnresolvedReason, usize>,
    pub unresolved: Vec<UnresolvedEntry>,
}

/// Top-level repository state shared by workers. Every mutation of the
/// top-level index happens while this is locked.
struct TopLevel {
    refs: BTreeMap<StudyId, StudyRef>,
    staged: Vec<StudyId>,
}

enum StudyRun {
    Done(StudyOutcome),
    Failed(String),
    Skipped,
}

pub struct App<G: GitPlumbing> {
    layout: Layout,
    config: ResolvedConfig,
    git: G,
}

impl<G: GitPlumbing> App<G> {
    pub fn new(layout: Layout, config: ResolvedConfig, git: G) -> Self {
        Self {
            layout,
            config,
            git,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn git(&self) -> &G {
        &self.git
    }

    pub fn organize(
        &self,
        catalog: &Catalog,
        options: &OrganizeOptions,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<OrganizeResult, StudyError> {
        let started = Instant::now();
        self.ensure_top_level()?;
        let targets = compile_targets(&options.targets)?;

        let classification = classify(catalog);
        sink.event(ProgressEvent {
            message: format!(
                "phase=Classify; {} studies, {} unresolved",
                classification.plans.len(),
                classification.rejected.len()
            ),
            elapsed: Some(started.elapsed()),
        });

        let mut registry = UnresolvedRegistry::load(&self.layout.registry_path())?;
        let reconcile = registry.reconcile(&classification.rejected, Utc::now());

        let work = classification
            .study_ids()
            .filter(|study| matches_targets(&targets, study))
            .cloned()
            .collect::<BTreeSet<_>>();
        let waves = dependency_waves(&classification, &work);
        let link_options = LinkOptions {
            allow_relink: options.allow_relink || self.config.allow_relink,
        };

        if options.dry_run {
            let refs = self.existing_refs(classification.study_ids())?;
            let (organized, failed) =
                self.preview(catalog, &classification, &work, &refs, link_options);
            let summary = summarize(&organized, &failed, registry.len());
            return Ok(OrganizeResult {
                dry_run: true,
                organized,
                unresolved: registry.entries().cloned().collect(),
                reconcile,
                failed,
                skipped: Vec::new(),
                top_level_commit: None,
                summary,
            });
        }

        let refs = self.existing_refs(
            classification
                .study_ids()
                .filter(|study| !work.contains(*study)),
        )?;
        let top_level = Mutex::new(TopLevel {
            refs,
            staged: Vec::new(),
        });
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .map_err(|err| StudyError::InvalidConfig(format!("worker pool: {err}")))?;

        let mut organized = Vec::new();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        for (index, wave) in waves.iter().enumerate() {
            info!(wave = index, studies = wave.len(), "dispatching wave");
            let runs = pool.install(|| {
                wave.par_iter()
                    .map(|study| {
                        let run = if cancel.is_cancelled() {
                            StudyRun::Skipped
                        } else {
                            self.run_study(
                                study,
                                catalog,
                                &classification,
                                link_options,
                                &top_level,
                                sink,
                            )
                        };
                        (study.clone(), run)
                    })
                    .collect::<Vec<_>>()
            });
            for (study, run) in runs {
                match run {
                    StudyRun::Done(outcome) => organized.push(outcome),
                    StudyRun::Failed(message) => failed.push(StudyFailure {
                        study_id: study,
                        error: message,
                    }),
                    StudyRun::Skipped => skipped.push(study),
                }
            }
        }

        let top_level_commit = {
            let guard = lock(&top_level);
            let commit = self.commit_top_level(&guard.staged)?;
            registry.save(&self.layout.registry_path())?;
            commit
        };

        let summary = summarize(&organized, &failed, registry.len());
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; organized={} failed={} skipped={} unresolved={}",
                summary.organized_count,
                summary.failed_count,
                skipped.len(),
                summary.unresolved_count
            ),
            elapsed: Some(started.elapsed()),
        });

        if organized.is_empty() && !failed.is_empty() {
            return Err(StudyError::AllStudiesFailed {
                count: failed.len(),
                study_ids: failed
                    .iter()
                    .map(|failure| failure.study_id.to_string())
                    .collect(),
            });
        }

        Ok(OrganizeResult {
            dry_run: false,
            organized,
            unresolved: registry.entries().cloned().collect(),
            reconcile,
            failed,
            skipped,
            top_level_commit,
            summary,
        })
    }

    /// Derives the lifecycle state of every study the descriptors imply.
    pub fn status(&self, catalog: &Catalog) -> Result<StatusResult, StudyError> {
        let classification = classify(catalog);
        let refs = self.existing_refs(classification.study_ids())?;
        let tracker = StateTracker::new(&self.git);

        let mut studies = Vec::new();
        for plan in classification.plans.values() {
            let dir = self.layout.study_dir(&plan.study_id);
            let link_plan = plan_links(plan, catalog, &refs)?;
            let state = tracker.derive(&dir, &link_plan.records())?;
            studies.push(StudyStatus {
                study_id: plan.study_id.clone(),
                state,
                path: dir.to_string(),
            });
        }
        Ok(StatusResult { studies })
    }

    pub fn unresolved(&self) -> Result<UnresolvedResult, StudyError> {
        let registry = UnresolvedRegistry::load(&self.layout.registry_path())?;
        Ok(UnresolvedResult {
            count: registry.len(),
            by_reason: registry.summary_by_reason(),
            unresolved: registry.entries().cloned().collect(),
        })
    }

    fn ensure_top_level(&self) -> Result<(), StudyError> {
        if self.git.is_repository(self.layout.root()) {
            return Ok(());
        }
        Err(StudyError::RepositoryInitialization {
            path: self.layout.root().to_owned(),
            message: "not a git repository".to_string(),
        })
    }

    fn run_study(
        &self,
        study: &StudyId,
        catalog: &Catalog,
        classification: &Classification,
        options: LinkOptions,
        top_level: &Mutex<TopLevel>,
        sink: &dyn ProgressSink,
    ) -> StudyRun {
        let Some(plan) = classification.plan(study) else {
            return StudyRun::Failed(format!("no plan for {study}"));
        };
        let started = Instant::now();
        match self.organize_study(plan, catalog, options, top_level) {
            Ok(outcome) => {
                sink.event(ProgressEvent {
                    message: format!(
                        "phase=Link; {study} added={} updated={} state={}",
                        outcome.added.len(),
                        outcome.updated.len(),
                        outcome.state
                    ),
                    elapsed: Some(started.elapsed()),
                });
                StudyRun::Done(outcome)
            }
            Err(err) => {
                error!(study = %study, error = %err, "study failed");
                sink.event(ProgressEvent {
                    message: format!("phase=Link; {study} failed: {err}"),
                    elapsed: Some(started.elapsed()),
                });
                StudyRun::Failed(err.to_string())
            }
        }
    }

    fn organize_study(
        &self,
        plan: &StudyPlan,
        catalog: &Catalog,
        options: LinkOptions,
        top_level: &Mutex<TopLevel>,
    ) -> Result<StudyOutcome, StudyError> {
        let study = &plan.study_id;
        let dir = self.layout.study_dir(study);
        let url = self.config.study_url(study);
        let authors = format!("{} Contributors", self.config.github_org);
        let created = ensure_study_repository(&self.git, &dir, study, &url, &authors)?;

        let refs = lock(top_level).refs.clone();
        let link_plan = plan_links(plan, catalog, &refs)?;
        for pending in &link_plan.pending_studies {
            warn!(study = %study, linked = %pending, "cross-link pending");
        }

        let tracker = StateTracker::new(&self.git);
        let records = link_plan.records();
        let before = tracker.derive(&dir, &records)?;
        let linked = Linker::new(&self.git).link(&dir, study.as_str(), &link_plan.links, options)?;

        let state = tracker.derive(&dir, &records)?;
        check_linked(before, state).map_err(|err| {
            error!(study = %study, %before, %state, "link step left the study unorganized");
            err
        })?;

        let revision = self
            .git
            .head(&dir)?
            .ok_or_else(|| StudyError::StudyRepository {
                path: dir.clone(),
                message: "no commit after linking".to_string(),
            })?;
        self.register(
            top_level,
            study,
            StudyRef {
                source_url: url,
                revision,
            },
        )?;

        Ok(StudyOutcome {
            study_id: study.clone(),
            state,
            created,
            added: linked.added,
            updated: linked.updated,
            unchanged: linked.unchanged,
            commit: linked.commit,
            pending_studies: link_plan.pending_studies,
            stale: linked.stale,
        })
    }

    /// Stages the study as a link of the top-level repository. A failed
    /// registration leaves the index as the earlier registrations left it.
    fn register(
        &self,
        top_level: &Mutex<TopLevel>,
        study: &StudyId,
        study_ref: StudyRef,
    ) -> Result<(), StudyError> {
        let mut guard = lock(top_level);
        let link = registration(study, &study_ref);
        match Linker::new(&self.git).stage(
            self.layout.root(),
            std::slice::from_ref(&link),
            LinkOptions::default(),
        ) {
            Ok(outcome) => {
                if outcome.changed() {
                    guard.staged.push(study.clone());
                }
                guard.refs.insert(study.clone(), study_ref);
                Ok(())
            }
            Err(err) => {
                self.restore_top_level(&mut guard);
                Err(err)
            }
        }
    }

    /// Resets the top-level index to HEAD and stages the registrations made
    /// earlier in this run again. If that fails too, nothing is left staged.
    fn restore_top_level(&self, top_level: &mut TopLevel) {
        let root = self.layout.root();
        let linker = Linker::new(&self.git);
        let restored = self.git.discard_staged(root).and_then(|()| {
            top_level.staged.iter().try_for_each(|study| {
                let Some(study_ref) = top_level.refs.get(study) else {
                    return Ok(());
                };
                let link = registration(study, study_ref);
                linker
                    .stage(root, std::slice::from_ref(&link), LinkOptions::default())
                    .map(|_| ())
            })
        });
        if let Err(err) = restored {
            error!(error = %err, "failed to restore top-level registrations");
            if let Err(err) = self.git.discard_staged(root) {
                error!(error = %err, "failed to discard top-level index");
            }
            top_level.staged.clear();
        }
    }

    fn commit_top_level(&self, staged: &[StudyId]) -> Result<Option<Revision>, StudyError> {
        let root = self.layout.root();
        if staged.is_empty() || !self.git.has_staged_changes(root)? {
            return Ok(None);
        }
        let noun = if staged.len() == 1 { "study" } else { "studies" };
        let mut message = format!("Register {} {noun}\n", staged.len());
        for study in staged {
            message.push_str(&format!("\n- {study}"));
        }
        message.push('\n');
        let revision = self.git.commit(root, &message)?;
        info!(studies = staged.len(), commit = %revision.short(), "committed top-level");
        Ok(Some(revision))
    }

    fn preview(
        &self,
        catalog: &Catalog,
        classification: &Classification,
        work: &BTreeSet<StudyId>,
        refs: &BTreeMap<StudyId, StudyRef>,
        options: LinkOptions,
    ) -> (Vec<StudyOutcome>, Vec<StudyFailure>) {
        let linker = Linker::new(&self.git);
        let tracker = StateTracker::new(&self.git);
        let mut organized = Vec::new();
        let mut failed = Vec::new();

        for plan in classification
            .plans
            .values()
            .filter(|plan| work.contains(&plan.study_id))
        {
            let dir = self.layout.study_dir(&plan.study_id);
            let result = plan_links(plan, catalog, refs).and_then(|link_plan| {
                let preview = linker.preview(&dir, &link_plan.links, options)?;
                let state = tracker.derive(&dir, &link_plan.records())?;
                Ok(StudyOutcome {
                    study_id: plan.study_id.clone(),
                    state,
                    created: !self.git.is_repository(&dir),
                    added: preview.added,
                    updated: preview.updated,
                    unchanged: preview.unchanged,
                    commit: None,
                    pending_studies: link_plan.pending_studies,
                    stale: preview.stale,
                })
            });
            match result {
                Ok(outcome) => organized.push(outcome),
                Err(err) => failed.push(StudyFailure {
                    study_id: plan.study_id.clone(),
                    error: err.to_string(),
                }),
            }
        }
        (organized, failed)
    }

    /// Current revisions of study repositories already on disk.
    fn existing_refs<'a>(
        &self,
        studies: impl Iterator<Item = &'a StudyId>,
    ) -> Result<BTreeMap<StudyId, StudyRef>, StudyError> {
        let mut refs = BTreeMap::new();
        for study in studies {
            let dir = self.layout.study_dir(study);
            if !self.git.is_repository(&dir) {
                continue;
            }
            if let Some(revision) = self.git.head(&dir)? {
                refs.insert(
                    study.clone(),
                    StudyRef {
                        source_url: self.config.study_url(study),
                        revision,
                    },
                );
            }
        }
        Ok(refs)
    }
}

fn registration(study: &StudyId, study_ref: &StudyRef) -> PlannedLink {
    PlannedLink {
        kind: LinkKind::Study,
        record: LinkRecord {
            path: study.to_string(),
            name: study.to_string(),
            source_url: study_ref.source_url.clone(),
            revision: study_ref.revision.clone(),
            instance_id: None,
        },
    }
}

fn lock(top_level: &Mutex<TopLevel>) -> MutexGuard<'_, TopLevel> {
    top_level.lock().unwrap_or_else(PoisonError::into_inner)
}

fn summarize(organized: &[StudyOutcome], failed: &[StudyFailure], unresolved: usize) -> RunSummary {
    RunSummary {
        organized_count: organized.len(),
        unresolved_count: unresolved,
        failed_count: failed.len(),
        failed_study_ids: failed
            .iter()
            .map(|failure| failure.study_id.clone())
            .collect(),
    }
}

/// Groups studies so that every study runs after the studies it links to.
fn dependency_waves(classification: &Classification, work: &BTreeSet<StudyId>) -> Vec<Vec<StudyId>> {
    let mut remaining = work.clone();
    let mut waves = Vec::new();
    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .filter(|study| {
                classification.plan(study).is_none_or(|plan| {
                    plan.linked_studies
                        .iter()
                        .all(|linked| linked == *study || !remaining.contains(linked))
                })
            })
            .cloned()
            .collect::<Vec<_>>();
        if ready.is_empty() {
            warn!(studies = remaining.len(), "cyclic cross-links; running the rest together");
            waves.push(remaining.into_iter().collect());
            break;
        }
        for study in &ready {
            remaining.remove(study);
        }
        waves.push(ready);
    }
    waves
}

fn compile_targets(patterns: &[String]) -> Result<Vec<Regex>, StudyError> {
    patterns
        .iter()
        .map(|pattern| {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                return Err(StudyError::InvalidTarget("empty pattern".to_string()));
            }
            let mut source = String::from("^");
            for ch in pattern.chars() {
                match ch {
                    '*' => source.push_str(".*"),
                    '?' => source.push('.'),
                    other => source.push_str(&regex::escape(&other.to_string())),
                }
            }
            source.push('$');
            Regex::new(&source).map_err(|err| StudyError::InvalidTarget(err.to_string()))
        })
        .collect()
}

fn matches_targets(targets: &[Regex], study: &StudyId) -> bool {
    targets.is_empty() || targets.iter().any(|target| target.is_match(study.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DatasetDescriptor, DatasetId};

    fn rev(ch: char) -> Revision {
        ch.to_string().repeat(40).parse().unwrap()
    }

    fn raw(id: &str) -> DatasetDescriptor {
        DatasetDescriptor::raw(id.parse::<DatasetId>().unwrap(), format!("u/{id}"), rev('a'))
    }

    fn derived(id: &str, sources: &[&str]) -> DatasetDescriptor {
        DatasetDescriptor::derivative(
            id.parse().unwrap(),
            format!("u/{id}"),
            rev('b'),
            sources.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn cross_linked_studies_run_first() {
        let catalog = Catalog::new(vec![
            raw("dsA"),
            raw("dsB"),
            derived("dsX", &["dsA", "dsB"]),
        ]);
        let classification = classify(&catalog);
        let work = classification.study_ids().cloned().collect();
        let waves = dependency_waves(&classification, &work);

        let multi: StudyId = "study-dsA+dsB".parse().unwrap();
        assert_eq!(waves.len(), 2);
        assert!(waves[0].contains(&multi));
        assert_eq!(waves[1].len(), 2);
    }

    #[test]
    fn target_globs_anchor() {
        let targets = compile_targets(&["study-ds00000?".to_string()]).unwrap();
        assert!(matches_targets(&targets, &"study-ds000001".parse().unwrap()));
        assert!(!matches_targets(&targets, &"study-ds0000011".parse().unwrap()));
        assert!(matches_targets(&[], &"study-x".parse().unwrap()));
        assert!(compile_targets(&[" ".to_string()]).is_err());
    }
}
