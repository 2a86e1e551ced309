#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use study_organizer::app::{App, ProgressEvent, ProgressSink};
use study_organizer::config::{Config, ConfigLoader};
use study_organizer::domain::{DatasetDescriptor, DatasetId, Revision, StudyId};
use study_organizer::error::StudyError;
use study_organizer::git::{GitPlumbing, Manifest, ManifestEntry};
use study_organizer::planner::LinkRecord;
use study_organizer::store::Layout;

#[derive(Debug, Clone, Default)]
struct MemRepo {
    committed: Manifest,
    index: Manifest,
    staged_files: BTreeSet<String>,
    commits: Vec<String>,
    head: Option<Revision>,
}

/// In-memory stand-in for git. Repositories exist only as map entries, but
/// their directories are created on disk so file markers work.
#[derive(Default)]
pub struct MemoryGit {
    repos: Mutex<HashMap<Utf8PathBuf, MemRepo>>,
    counter: Mutex<u64>,
    failures: Mutex<Vec<(Utf8PathBuf, String)>>,
    partial_failures: Mutex<Vec<(Utf8PathBuf, String)>>,
    lost_on_commit: Mutex<Vec<(Utf8PathBuf, String)>>,
}

impl MemoryGit {
    pub fn fail_stage_at(&self, repo: &Utf8Path, path: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((repo.to_owned(), path.to_string()));
    }

    /// Stages the manifest entry but fails before the gitlink is written.
    pub fn fail_stage_partially_at(&self, repo: &Utf8Path, path: &str) {
        self.partial_failures
            .lock()
            .unwrap()
            .push((repo.to_owned(), path.to_string()));
    }

    /// Commits succeed but silently lose the entry at `path`.
    pub fn lose_on_commit(&self, repo: &Utf8Path, path: &str) {
        self.lost_on_commit
            .lock()
            .unwrap()
            .push((repo.to_owned(), path.to_string()));
    }

    pub fn commits(&self, repo: &Utf8Path) -> Vec<String> {
        self.repos
            .lock()
            .unwrap()
            .get(repo)
            .map(|repo| repo.commits.clone())
            .unwrap_or_default()
    }

    pub fn commit_count(&self, repo: &Utf8Path) -> usize {
        self.commits(repo).len()
    }

    pub fn committed(&self, repo: &Utf8Path) -> Manifest {
        self.repos
            .lock()
            .unwrap()
            .get(repo)
            .map(|repo| repo.committed.clone())
            .unwrap_or_default()
    }

    /// Writes an entry straight into the committed state.
    pub fn seed_entry(&self, repo: &Utf8Path, entry: ManifestEntry) {
        let mut repos = self.repos.lock().unwrap();
        let state = repos.get_mut(repo).expect("repository not initialized");
        state.committed.insert(entry.path.clone(), entry.clone());
        state.index.insert(entry.path.clone(), entry);
    }

    /// Drops an entry from both the index and the committed state.
    pub fn remove_entry(&self, repo: &Utf8Path, path: &str) {
        let mut repos = self.repos.lock().unwrap();
        let state = repos.get_mut(repo).expect("repository not initialized");
        state.committed.remove(path);
        state.index.remove(path);
    }

    fn next_revision(&self) -> Revision {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        format!("{:040x}", *counter).parse().unwrap()
    }

    fn with_repo<T>(
        &self,
        repo: &Utf8Path,
        f: impl FnOnce(&mut MemRepo) -> Result<T, StudyError>,
    ) -> Result<T, StudyError> {
        let mut repos = self.repos.lock().unwrap();
        match repos.get_mut(repo) {
            Some(state) => f(state),
            None => Err(StudyError::Git {
                command: "rev-parse".to_string(),
                message: format!("{repo} is not a repository"),
            }),
        }
    }
}

impl GitPlumbing for MemoryGit {
    fn is_repository(&self, repo: &Utf8Path) -> bool {
        self.repos.lock().unwrap().contains_key(repo)
    }

    fn init_repository(&self, repo: &Utf8Path) -> Result<(), StudyError> {
        fs::create_dir_all(repo.as_std_path()).unwrap();
        self.repos
            .lock()
            .unwrap()
            .entry(repo.to_owned())
            .or_default();
        Ok(())
    }

    fn read_manifest(&self, repo: &Utf8Path) -> Result<Manifest, StudyError> {
        self.with_repo(repo, |state| Ok(state.index.clone()))
    }

    fn stage_link(&self, repo: &Utf8Path, link: &LinkRecord) -> Result<(), StudyError> {
        let injected = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|(failing, path)| failing == repo && path == &link.path);
        if injected {
            return Err(StudyError::Git {
                command: "update-index".to_string(),
                message: format!("injected failure at {}", link.path),
            });
        }
        let partial = self
            .partial_failures
            .lock()
            .unwrap()
            .iter()
            .any(|(failing, path)| failing == repo && path == &link.path);
        if partial {
            self.with_repo(repo, |state| {
                state.index.insert(
                    link.path.clone(),
                    ManifestEntry {
                        name: link.name.clone(),
                        path: link.path.clone(),
                        source_url: Some(link.source_url.clone()),
                        revision: None,
                        instance_id: link.instance_id.clone(),
                    },
                );
                Ok(())
            })?;
            return Err(StudyError::Git {
                command: "update-index".to_string(),
                message: format!("injected failure after manifest write at {}", link.path),
            });
        }
        self.with_repo(repo, |state| {
            state.index.insert(
                link.path.clone(),
                ManifestEntry {
                    name: link.name.clone(),
                    path: link.path.clone(),
                    source_url: Some(link.source_url.clone()),
                    revision: Some(link.revision.clone()),
                    instance_id: link.instance_id.clone(),
                },
            );
            Ok(())
        })
    }

    fn stage_file(&self, repo: &Utf8Path, relative: &str) -> Result<(), StudyError> {
        self.with_repo(repo, |state| {
            state.staged_files.insert(relative.to_string());
            Ok(())
        })
    }

    fn has_staged_changes(&self, repo: &Utf8Path) -> Result<bool, StudyError> {
        self.with_repo(repo, |state| {
            Ok(state.index != state.committed || !state.staged_files.is_empty())
        })
    }

    fn commit(&self, repo: &Utf8Path, message: &str) -> Result<Revision, StudyError> {
        let revision = self.next_revision();
        let lost = self
            .lost_on_commit
            .lock()
            .unwrap()
            .iter()
            .filter(|(failing, _)| failing == repo)
            .map(|(_, path)| path.clone())
            .collect::<Vec<_>>();
        self.with_repo(repo, |state| {
            if state.index == state.committed && state.staged_files.is_empty() {
                return Err(StudyError::Git {
                    command: "commit".to_string(),
                    message: "nothing to commit".to_string(),
                });
            }
            state.committed = state.index.clone();
            for path in &lost {
                state.committed.remove(path);
                state.index.remove(path);
            }
            state.staged_files.clear();
            state.commits.push(message.to_string());
            state.head = Some(revision.clone());
            Ok(revision)
        })
    }

    fn head(&self, repo: &Utf8Path) -> Result<Option<Revision>, StudyError> {
        self.with_repo(repo, |state| Ok(state.head.clone()))
    }

    fn discard_staged(&self, repo: &Utf8Path) -> Result<(), StudyError> {
        self.with_repo(repo, |state| {
            state.index = state.committed.clone();
            state.staged_files.clear();
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event.message);
    }
}

pub struct Fixture {
    _temp: TempDir,
    pub root: Utf8PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("studies")).unwrap();
        Self { _temp: temp, root }
    }

    /// App over a fresh in-memory git with an initialized top-level repository.
    pub fn app(&self) -> App<MemoryGit> {
        let app = self.bare_app();
        app.git().init_repository(&self.root).unwrap();
        app
    }

    pub fn bare_app(&self) -> App<MemoryGit> {
        let config = ConfigLoader::resolve_config(Config {
            workers: Some(2),
            ..Config::default()
        })
        .unwrap();
        App::new(Layout::new(self.root.clone()), config, MemoryGit::default())
    }

    pub fn study_dir(&self, study: &str) -> Utf8PathBuf {
        self.root.join(study)
    }
}

pub fn rev(ch: char) -> Revision {
    ch.to_string().repeat(40).parse().unwrap()
}

pub fn id(value: &str) -> DatasetId {
    value.parse().unwrap()
}

pub fn study(value: &str) -> StudyId {
    value.parse().unwrap()
}

pub fn raw(name: &str) -> DatasetDescriptor {
    DatasetDescriptor::raw(
        id(name),
        format!("https://github.com/OpenNeuroDatasets/{name}"),
        rev('a'),
    )
}

pub fn derived(name: &str, sources: &[&str]) -> DatasetDescriptor {
    DatasetDescriptor::derivative(
        id(name),
        format!("https://github.com/OpenNeuroDerivatives/{name}"),
        rev('b'),
        sources.iter().map(|source| source.to_string()).collect(),
    )
}
