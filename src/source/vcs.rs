//! Version-control collaborator for the aggregate checkout.
//!
//! Network-facing operations (clone from the remote, pull, submodule update,
//! branch restore) shell out to `git` through a [`CommandRunner`] so they
//! honour the user's credentials and git configuration. Local operations
//! (listing submodules, cloning a sub-checkout, reset and clean) use `git2`
//! on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use git2::{Repository, ResetType, StatusOptions};

use crate::errors::VcsError;
use crate::process::{CommandRunner, CommandSpec};

#[async_trait]
pub trait Vcs: Send + Sync {
    /// Clone the aggregate checkout from `url` into `root` (first run).
    async fn clone_aggregate(&self, url: &str, root: &Path) -> Result<(), VcsError>;

    /// Bring `root` and its sub-checkouts back to the recorded commits,
    /// pulling from the remote first when `pull` is set.
    async fn refresh(&self, root: &Path, pull: bool) -> Result<(), VcsError>;

    /// Absolute paths of every initialised sub-checkout.
    async fn list_sub_checkouts(&self, root: &Path) -> Result<Vec<PathBuf>, VcsError>;

    /// Recreate a local tracking branch for `branch` from `origin`.
    async fn restore_branch(&self, checkout: &Path, branch: &str) -> Result<(), VcsError>;

    /// Clone `src` into the (absent) directory `dest`.
    async fn clone_checkout(&self, src: &Path, dest: &Path) -> Result<(), VcsError>;

    /// Hard reset to HEAD and delete untracked and ignored files.
    async fn hard_reset_and_clean(&self, path: &Path) -> Result<(), VcsError>;
}

pub struct GitVcs {
    runner: Arc<dyn CommandRunner>,
}

impl GitVcs {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<(), VcsError> {
        let spec = CommandSpec::new("git")
            .args(args.iter().copied())
            .current_dir(cwd);
        self.exec(spec).await
    }

    async fn exec(&self, spec: CommandSpec) -> Result<(), VcsError> {
        let command = spec.display();
        self.runner
            .run(&spec)
            .await
            .map(|_| ())
            .map_err(|e| VcsError::from_process(command, e))
    }
}

fn git_err(path: &Path) -> impl FnOnce(git2::Error) -> VcsError + '_ {
    move |source| VcsError::Git {
        path: path.to_path_buf(),
        source,
    }
}

async fn blocking<F, R>(f: F) -> Result<R, VcsError>
where
    F: FnOnce() -> Result<R, VcsError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VcsError::OperationFailed {
            command: "git2".to_string(),
            exit_info: format!("blocking task failed: {}", e),
        })?
}

#[async_trait]
impl Vcs for GitVcs {
    async fn clone_aggregate(&self, url: &str, root: &Path) -> Result<(), VcsError> {
        // Run from our own working directory so a relative `root` means the
        // same here as everywhere else. git creates missing parents itself.
        let dest = root.to_string_lossy().into_owned();
        self.exec(CommandSpec::new("git").args(["clone", "--recurse-submodules", url, &dest]))
            .await
    }

    async fn refresh(&self, root: &Path, pull: bool) -> Result<(), VcsError> {
        if pull {
            self.git(root, &["pull", "--ff-only"]).await?;
            self.git(root, &["submodule", "sync", "--recursive"]).await?;
        }
        self.git(root, &["reset", "--hard", "HEAD"]).await?;
        self.git(
            root,
            &["submodule", "update", "--init", "--recursive", "--force"],
        )
        .await
    }

    async fn list_sub_checkouts(&self, root: &Path) -> Result<Vec<PathBuf>, VcsError> {
        let root = root.to_path_buf();
        blocking(move || {
            let repo = Repository::open(&root).map_err(git_err(&root))?;
            let submodules = repo.submodules().map_err(git_err(&root))?;
            let mut paths: Vec<PathBuf> = submodules
                .iter()
                .map(|sm| root.join(sm.path()))
                .filter(|p| p.join(".git").exists())
                .collect();
            paths.sort();
            Ok(paths)
        })
        .await
    }

    async fn restore_branch(&self, checkout: &Path, branch: &str) -> Result<(), VcsError> {
        let upstream = format!("origin/{}", branch);
        self.git(checkout, &["branch", "--force", "--track", branch, &upstream])
            .await
    }

    async fn clone_checkout(&self, src: &Path, dest: &Path) -> Result<(), VcsError> {
        let src = src.to_path_buf();
        let dest = dest.to_path_buf();
        blocking(move || {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|source| VcsError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            let url = src.to_string_lossy().into_owned();
            git2::build::RepoBuilder::new()
                .clone(&url, &dest)
                .map_err(git_err(&dest))?;
            Ok(())
        })
        .await
    }

    async fn hard_reset_and_clean(&self, path: &Path) -> Result<(), VcsError> {
        let path = path.to_path_buf();
        blocking(move || {
            let repo = Repository::open(&path).map_err(git_err(&path))?;
            let head = repo
                .head()
                .and_then(|h| h.peel_to_commit())
                .map_err(git_err(&path))?;
            repo.reset(head.as_object(), ResetType::Hard, None)
                .map_err(git_err(&path))?;

            let mut opts = StatusOptions::new();
            opts.include_untracked(true)
                .include_ignored(true)
                .recurse_untracked_dirs(false)
                .recurse_ignored_dirs(false);
            let statuses = repo.statuses(Some(&mut opts)).map_err(git_err(&path))?;

            let doomed: Vec<PathBuf> = statuses
                .iter()
                .filter(|entry| {
                    let status = entry.status();
                    status.is_wt_new() || status.is_ignored()
                })
                .filter_map(|entry| entry.path().map(|p| path.join(p.trim_end_matches('/'))))
                .collect();

            for target in doomed {
                let removed = if target.is_dir() {
                    std::fs::remove_dir_all(&target)
                } else {
                    std::fs::remove_file(&target)
                };
                removed.map_err(|source| VcsError::Io {
                    path: target.clone(),
                    source,
                })?;
            }
            Ok(())
        })
        .await
    }
}
