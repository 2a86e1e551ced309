use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use camino::Utf8Path;
use serde::Serialize;
use tracing::debug;

use crate::domain::Revision;
use crate::error::StudyError;
use crate::planner::LinkRecord;

pub const GITMODULES: &str = ".gitmodules";
const GITLINK_MODE: &str = "160000";

/// One link as found on disk: `.gitmodules` supplies name and url, the index
/// supplies the pinned revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub name: String,
    pub path: String,
    pub source_url: Option<String>,
    pub revision: Option<Revision>,
    pub instance_id: Option<String>,
}

impl ManifestEntry {
    pub fn matches(&self, record: &LinkRecord) -> bool {
        self.source_url.as_deref() == Some(record.source_url.as_str())
            && self.revision.as_ref() == Some(&record.revision)
    }

    pub fn describe(&self) -> String {
        format!(
            "{} @ {}",
            self.source_url.as_deref().unwrap_or("<no url>"),
            self.revision
                .as_ref()
                .map(Revision::as_str)
                .unwrap_or("<no gitlink>")
        )
    }
}

/// Link manifest of one repository, keyed by path.
pub type Manifest = BTreeMap<String, ManifestEntry>;

/// Version-control primitives the linker needs. None of them transfer
/// content of linked repositories.
pub trait GitPlumbing: Send + Sync {
    fn is_repository(&self, repo: &Utf8Path) -> bool;
    fn init_repository(&self, repo: &Utf8Path) -> Result<(), StudyError>;
    fn read_manifest(&self, repo: &Utf8Path) -> Result<Manifest, StudyError>;
    /// Records the manifest entry and a gitlink at `link.path` in the index.
    fn stage_link(&self, repo: &Utf8Path, link: &LinkRecord) -> Result<(), StudyError>;
    fn stage_file(&self, repo: &Utf8Path, relative: &str) -> Result<(), StudyError>;
    fn has_staged_changes(&self, repo: &Utf8Path) -> Result<bool, StudyError>;
    fn commit(&self, repo: &Utf8Path, message: &str) -> Result<Revision, StudyError>;
    fn head(&self, repo: &Utf8Path) -> Result<Option<Revision>, StudyError>;
    /// Restores index and manifest to HEAD.
    fn discard_staged(&self, repo: &Utf8Path) -> Result<(), StudyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Clone)]
pub struct SystemGit {
    git: Option<PathBuf>,
    identity: CommitIdentity,
}

struct GitOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl SystemGit {
    pub fn new(identity: CommitIdentity) -> Self {
        Self {
            git: find_in_path("git"),
            identity,
        }
    }

    pub fn is_available(&self) -> bool {
        self.git.is_some()
    }

    fn require_git(&self) -> Result<&PathBuf, StudyError> {
        self.git
            .as_ref()
            .ok_or_else(|| StudyError::MissingTool("git".to_string()))
    }

    fn exec(&self, repo: &Utf8Path, args: &[&str]) -> Result<GitOutput, StudyError> {
        let git = self.require_git()?;
        debug!(repo = %repo, args = ?args, "git");
        let output = Command::new(git)
            .arg("-C")
            .arg(repo.as_std_path())
            .args(args)
            .output()
            .map_err(|err| StudyError::Git {
                command: command_label(args),
                message: err.to_string(),
            })?;
        Ok(GitOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn run(&self, repo: &Utf8Path, args: &[&str]) -> Result<String, StudyError> {
        let output = self.exec(repo, args)?;
        if output.code == Some(0) {
            return Ok(output.stdout);
        }
        let message = if output.stderr.is_empty() {
            format!("exit status {:?}", output.code)
        } else {
            output.stderr
        };
        Err(StudyError::Git {
            command: command_label(args),
            message,
        })
    }

    fn read_gitmodules(&self, repo: &Utf8Path) -> Result<BTreeMap<String, Submodule>, StudyError> {
        let mut modules = BTreeMap::<String, Submodule>::new();
        if !repo.join(GITMODULES).as_std_path().exists() {
            return Ok(modules);
        }
        let args = [
            "config",
            "-f",
            GITMODULES,
            "--get-regexp",
            r"^submodule\..*\.(path|url|datalad-id)$",
        ];
        let output = self.exec(repo, &args)?;
        match output.code {
            Some(0) => {}
            // No matching keys.
            Some(1) => return Ok(modules),
            _ => {
                return Err(StudyError::Git {
                    command: command_label(&args),
                    message: output.stderr,
                });
            }
        }
        for line in output.stdout.lines() {
            let Some((key, value)) = line.split_once(' ') else {
                continue;
            };
            let Some((name, variable)) = key
                .strip_prefix("submodule.")
                .and_then(|rest| rest.rsplit_once('.'))
            else {
                continue;
            };
            let module = modules.entry(name.to_string()).or_default();
            match variable {
                "path" => module.path = Some(value.to_string()),
                "url" => module.url = Some(value.to_string()),
                "datalad-id" => module.instance_id = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(modules)
    }

    fn read_gitlinks(&self, repo: &Utf8Path) -> Result<BTreeMap<String, Revision>, StudyError> {
        let stdout = self.run(repo, &["ls-files", "--stage"])?;
        let mut links = BTreeMap::new();
        for line in stdout.lines() {
            let Some((meta, path)) = line.split_once('\t') else {
                continue;
            };
            let mut fields = meta.split_whitespace();
            if fields.next() != Some(GITLINK_MODE) {
                continue;
            }
            if let Some(revision) = fields.next().and_then(|sha| sha.parse().ok()) {
                links.insert(path.to_string(), revision);
            }
        }
        Ok(links)
    }
}

#[derive(Debug, Default)]
struct Submodule {
    path: Option<String>,
    url: Option<String>,
    instance_id: Option<String>,
}

impl GitPlumbing for SystemGit {
    fn is_repository(&self, repo: &Utf8Path) -> bool {
        repo.join(".git").as_std_path().exists()
            && self.run(repo, &["rev-parse", "--git-dir"]).is_ok()
    }

    fn init_repository(&self, repo: &Utf8Path) -> Result<(), StudyError> {
        fs::create_dir_all(repo.as_std_path())
            .map_err(|err| StudyError::Filesystem(err.to_string()))?;
        self.run(repo, &["init", "-q"]).map(|_| ())
    }

    fn read_manifest(&self, repo: &Utf8Path) -> Result<Manifest, StudyError> {
        let modules = self.read_gitmodules(repo)?;
        let mut gitlinks = self.read_gitlinks(repo)?;

        let mut manifest = Manifest::new();
        for (name, module) in modules {
            let Some(path) = module.path else {
                continue;
            };
            let revision = gitlinks.remove(&path);
            manifest.insert(
                path.clone(),
                ManifestEntry {
                    name,
                    path,
                    source_url: module.url,
                    revision,
                    instance_id: module.instance_id,
                },
            );
        }
        // Gitlinks with no manifest entry still occupy their path.
        for (path, revision) in gitlinks {
            manifest.insert(
                path.clone(),
                ManifestEntry {
                    name: String::new(),
                    path,
                    source_url: None,
                    revision: Some(revision),
                    instance_id: None,
                },
            );
        }
        Ok(manifest)
    }

    fn stage_link(&self, repo: &Utf8Path, link: &LinkRecord) -> Result<(), StudyError> {
        let path_key = format!("submodule.{}.path", link.name);
        let url_key = format!("submodule.{}.url", link.name);
        self.run(repo, &["config", "-f", GITMODULES, &path_key, &link.path])?;
        self.run(repo, &["config", "-f", GITMODULES, &url_key, &link.source_url])?;
        if let Some(instance_id) = &link.instance_id {
            let id_key = format!("submodule.{}.datalad-id", link.name);
            let datalad_url_key = format!("submodule.{}.datalad-url", link.name);
            self.run(repo, &["config", "-f", GITMODULES, &id_key, instance_id])?;
            self.run(repo, &["config", "-f", GITMODULES, &datalad_url_key, &link.source_url])?;
        }
        self.run(repo, &["add", "--", GITMODULES])?;
        let cacheinfo = format!("{GITLINK_MODE},{},{}", link.revision, link.path);
        self.run(repo, &["update-index", "--add", "--cacheinfo", &cacheinfo])?;
        Ok(())
    }

    fn stage_file(&self, repo: &Utf8Path, relative: &str) -> Result<(), StudyError> {
        self.run(repo, &["add", "--", relative]).map(|_| ())
    }

    fn has_staged_changes(&self, repo: &Utf8Path) -> Result<bool, StudyError> {
        let args = ["diff", "--cached", "--quiet"];
        let output = self.exec(repo, &args)?;
        match output.code {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(StudyError::Git {
                command: command_label(&args),
                message: output.stderr,
            }),
        }
    }

    fn commit(&self, repo: &Utf8Path, message: &str) -> Result<Revision, StudyError> {
        let name = format!("user.name={}", self.identity.name);
        let email = format!("user.email={}", self.identity.email);
        self.run(
            repo,
            &[
                "-c",
                &name,
                "-c",
                &email,
                "commit",
                "-q",
                "--no-verify",
                "-m",
                message,
            ],
        )?;
        self.head(repo)?.ok_or_else(|| StudyError::Git {
            command: "commit".to_string(),
            message: "HEAD missing after commit".to_string(),
        })
    }

    fn head(&self, repo: &Utf8Path) -> Result<Option<Revision>, StudyError> {
        let output = self.exec(repo, &["rev-parse", "--verify", "-q", "HEAD"])?;
        if output.code != Some(0) {
            return Ok(None);
        }
        output.stdout.trim().parse().map(Some)
    }

    fn discard_staged(&self, repo: &Utf8Path) -> Result<(), StudyError> {
        if self.head(repo)?.is_none() {
            self.run(repo, &["rm", "-r", "-q", "--cached", "--ignore-unmatch", "."])?;
            return remove_gitmodules(repo);
        }
        self.run(repo, &["reset", "-q"])?;
        let tracked = self
            .exec(repo, &["cat-file", "-e", "HEAD:.gitmodules"])?
            .code
            == Some(0);
        if tracked {
            self.run(repo, &["checkout", "-q", "HEAD", "--", GITMODULES])?;
            Ok(())
        } else {
            remove_gitmodules(repo)
        }
    }
}

fn remove_gitmodules(repo: &Utf8Path) -> Result<(), StudyError> {
    let path = repo.join(GITMODULES);
    if path.as_std_path().exists() {
        fs::remove_file(path.as_std_path()).map_err(|err| StudyError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

fn command_label(args: &[&str]) -> String {
    args.iter()
        .find(|arg| !arg.starts_with('-') && !arg.contains('='))
        .map(|arg| arg.to_string())
        .unwrap_or_else(|| "git".to_string())
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if is_file(&plain) {
            return Some(plain);
        }
    }
    None
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|meta| meta.is_file()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_label_skips_flags_and_config() {
        assert_eq!(command_label(&["-c", "user.name=x", "commit", "-q"]), "commit");
        assert_eq!(command_label(&["update-index", "--add"]), "update-index");
    }

    #[test]
    fn manifest_entry_matching() {
        let revision: Revision = "a".repeat(40).parse().unwrap();
        let record = LinkRecord {
            path: "sourcedata/ds1".to_string(),
            name: "sourcedata-ds1".to_string(),
            source_url: "https://example.org/ds1".to_string(),
            revision: revision.clone(),
            instance_id: None,
        };
        let mut entry = ManifestEntry {
            name: record.name.clone(),
            path: record.path.clone(),
            source_url: Some(record.source_url.clone()),
            revision: Some(revision),
            instance_id: None,
        };
        assert!(entry.matches(&record));
        entry.revision = None;
        assert!(!entry.matches(&record));
        assert!(entry.describe().ends_with("<no gitlink>"));
    }
}
