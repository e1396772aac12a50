//! The aggregate checkout: what currently exists to build.
//!
//! [`SourceRepoManager`] owns a [`Vcs`] collaborator and exposes refresh,
//! package enumeration, planning against the build history, and ephemeral
//! working copies for individual builds.

pub mod vcs;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::errors::{RunError, VcsError};
use crate::history::{HistoryHandle, HistorySnapshot};
use crate::version::{self, Package, VersionString};

pub use vcs::{GitVcs, Vcs};

/// A package and the sub-checkout it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePackage {
    pub package: Package,
    pub location: PathBuf,
}

/// A package selected for building in this run.
#[derive(Debug, Clone, Serialize)]
pub struct ToBuildEntry {
    pub package: Package,
    pub source_location: PathBuf,
    /// Latest successfully built version, if any.
    pub previous: Option<VersionString>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UpToDate,
    Excluded,
    NotSelected,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::UpToDate => write!(f, "up to date"),
            SkipReason::Excluded => write!(f, "excluded"),
            SkipReason::NotSelected => write!(f, "not selected"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedPackage {
    pub name: String,
    pub version: VersionString,
    pub reason: SkipReason,
}

/// The outcome of planning: what to build and what was left alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildPlan {
    pub to_build: Vec<ToBuildEntry>,
    pub skipped: Vec<SkippedPackage>,
}

/// Decide what to build from one history snapshot.
///
/// A package is selected when it was never built or its current version is
/// newer than the latest successful build. `only` selects exactly that
/// package regardless of versions. `exclude` always wins.
pub fn select_packages(
    packages: Vec<SourcePackage>,
    snapshot: &HistorySnapshot,
    only: Option<&str>,
    exclude: &BTreeSet<String>,
) -> BuildPlan {
    let mut plan = BuildPlan::default();

    if let Some(name) = only
        && !packages.iter().any(|p| p.package.name == name)
    {
        tracing::warn!(package = name, "requested package not found in the checkout");
    }

    for SourcePackage { package, location } in packages {
        let previous = snapshot.get(&package.name).cloned();

        let reason = if exclude.contains(&package.name) {
            Some(SkipReason::Excluded)
        } else if let Some(name) = only {
            (package.name != name).then_some(SkipReason::NotSelected)
        } else {
            match &previous {
                Some(built) if package.version <= *built => Some(SkipReason::UpToDate),
                _ => None,
            }
        };

        match reason {
            Some(reason) => {
                tracing::debug!(package = %package.name, version = %package.version, %reason, "skipping");
                plan.skipped.push(SkippedPackage {
                    name: package.name,
                    version: package.version,
                    reason,
                });
            }
            None => {
                tracing::debug!(
                    package = %package.name,
                    version = %package.version,
                    previous = ?previous.as_ref().map(VersionString::as_str),
                    "needs build"
                );
                plan.to_build.push(ToBuildEntry {
                    package,
                    source_location: location,
                    previous,
                });
            }
        }
    }

    plan
}

/// An isolated clone of one package, removed when dropped.
#[derive(Debug)]
pub struct WorkingCopy {
    path: PathBuf,
    package: String,
}

impl WorkingCopy {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn package(&self) -> &str {
        &self.package
    }
}

impl Drop for WorkingCopy {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove working copy");
        }
    }
}

pub struct SourceRepoManager {
    vcs: Arc<dyn Vcs>,
    root: PathBuf,
    url: String,
    aux_branch: String,
}

impl SourceRepoManager {
    pub fn new(vcs: Arc<dyn Vcs>, root: PathBuf, url: String, aux_branch: String) -> Self {
        Self {
            vcs,
            root,
            url,
            aux_branch,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reset the aggregate checkout to its recorded state, pulling first
    /// when `update_from_origin` is set. Clones it if absent.
    pub async fn refresh(&self, update_from_origin: bool) -> Result<(), VcsError> {
        if !self.root.join(".git").exists() {
            tracing::info!(url = %self.url, root = %self.root.display(), "cloning aggregate checkout");
            self.vcs.clone_aggregate(&self.url, &self.root).await?;
        }

        tracing::info!(root = %self.root.display(), pull = update_from_origin, "refreshing checkout");
        self.vcs.refresh(&self.root, update_from_origin).await?;

        // Best-effort: a missing auxiliary branch only affects tarball bookkeeping.
        for checkout in self.vcs.list_sub_checkouts(&self.root).await? {
            if let Err(e) = self.vcs.restore_branch(&checkout, &self.aux_branch).await {
                tracing::warn!(
                    checkout = %checkout.display(),
                    branch = %self.aux_branch,
                    error = %e,
                    "could not restore auxiliary branch, skipping"
                );
            }
        }
        Ok(())
    }

    /// Every sub-checkout with its package identity.
    pub async fn list_packages(&self) -> Result<Vec<SourcePackage>, RunError> {
        let checkouts = self.vcs.list_sub_checkouts(&self.root).await?;
        if checkouts.is_empty() {
            return Err(RunError::EmptyRepository {
                root: self.root.clone(),
            });
        }

        checkouts
            .into_iter()
            .map(|location| {
                let package = version::read_package(&location)?;
                Ok::<_, RunError>(SourcePackage { package, location })
            })
            .collect()
    }

    /// Plan against one consistent snapshot of the history.
    pub async fn plan(
        &self,
        history: &HistoryHandle,
        only: Option<&str>,
        exclude: &BTreeSet<String>,
    ) -> Result<BuildPlan, RunError> {
        let packages = self.list_packages().await?;
        let snapshot = history.snapshot().await?;
        Ok(select_packages(packages, &snapshot, only, exclude))
    }

    pub async fn filter_to_build(
        &self,
        history: &HistoryHandle,
        only: Option<&str>,
        exclude: &BTreeSet<String>,
    ) -> Result<Vec<ToBuildEntry>, RunError> {
        Ok(self.plan(history, only, exclude).await?.to_build)
    }

    /// Clone an entry's checkout into `root_dir/<package>`.
    pub async fn materialize_working_copy(
        &self,
        entry: &ToBuildEntry,
        root_dir: &Path,
    ) -> Result<WorkingCopy, VcsError> {
        let path = root_dir.join(&entry.package.name);
        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(|source| VcsError::Io {
                path: path.clone(),
                source,
            })?;
        }
        // Own the directory before cloning so a failed clone is still removed.
        let copy = WorkingCopy {
            path,
            package: entry.package.name.clone(),
        };
        self.vcs
            .clone_checkout(&entry.source_location, &copy.path)
            .await?;
        Ok(copy)
    }

    /// Clean every working copy under `root_dir` and delete stray files
    /// directly inside it.
    pub async fn reset_working_area(&self, root_dir: &Path) -> Result<(), VcsError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| VcsError::Io { path, source }
        };

        let entries = std::fs::read_dir(root_dir).map_err(io_err(root_dir))?;
        for entry in entries {
            let entry = entry.map_err(io_err(root_dir))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(io_err(&path))?;
            if file_type.is_dir() {
                if path.join(".git").exists() {
                    self.vcs.hard_reset_and_clean(&path).await?;
                }
            } else {
                tracing::debug!(path = %path.display(), "removing stray build artifact");
                std::fs::remove_file(&path).map_err(io_err(&path))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::history::{AttemptOutcome, BuildAttempt, HistoryDb};
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// In-memory `Vcs`: sub-checkouts are plain directories, clones are copies.
    #[derive(Default)]
    pub(crate) struct FakeVcs {
        pub checkouts: Mutex<Vec<PathBuf>>,
        pub calls: Mutex<Vec<String>>,
        pub fail_restore: bool,
        pub fail_clone_for: Option<String>,
    }

    impl FakeVcs {
        pub(crate) fn with_checkouts(checkouts: Vec<PathBuf>) -> Self {
            Self {
                checkouts: Mutex::new(checkouts),
                ..Default::default()
            }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            let target = dest.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                copy_dir(&entry.path(), &target)?;
            } else {
                fs::copy(entry.path(), target)?;
            }
        }
        Ok(())
    }

    #[async_trait::async_trait]
    impl Vcs for FakeVcs {
        async fn clone_aggregate(&self, url: &str, root: &Path) -> Result<(), VcsError> {
            self.log(format!("clone_aggregate {}", url));
            fs::create_dir_all(root.join(".git")).unwrap();
            Ok(())
        }

        async fn refresh(&self, _root: &Path, pull: bool) -> Result<(), VcsError> {
            self.log(format!("refresh pull={}", pull));
            Ok(())
        }

        async fn list_sub_checkouts(&self, _root: &Path) -> Result<Vec<PathBuf>, VcsError> {
            Ok(self.checkouts.lock().unwrap().clone())
        }

        async fn restore_branch(&self, checkout: &Path, branch: &str) -> Result<(), VcsError> {
            self.log(format!("restore {} {}", checkout.display(), branch));
            if self.fail_restore {
                return Err(VcsError::OperationFailed {
                    command: "git branch".into(),
                    exit_info: "no such branch".into(),
                });
            }
            Ok(())
        }

        async fn clone_checkout(&self, src: &Path, dest: &Path) -> Result<(), VcsError> {
            self.log(format!("clone {}", src.display()));
            if let Some(name) = &self.fail_clone_for
                && src.ends_with(name)
            {
                fs::create_dir_all(dest).unwrap();
                return Err(VcsError::OperationFailed {
                    command: "clone".into(),
                    exit_info: "simulated".into(),
                });
            }
            copy_dir(src, dest).map_err(|source| VcsError::Io {
                path: dest.to_path_buf(),
                source,
            })
        }

        async fn hard_reset_and_clean(&self, path: &Path) -> Result<(), VcsError> {
            self.log(format!("clean {}", path.display()));
            Ok(())
        }
    }

    pub(crate) fn write_package(root: &Path, name: &str, version: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("debian")).unwrap();
        fs::write(
            dir.join("debian/changelog"),
            format!("{} ({}) unstable; urgency=medium\n", name, version),
        )
        .unwrap();
        dir
    }

    fn source(name: &str, version: &str) -> SourcePackage {
        SourcePackage {
            package: Package {
                name: name.to_string(),
                version: VersionString::parse(version).unwrap(),
                distributions: vec!["unstable".to_string()],
            },
            location: PathBuf::from("/repo").join(name),
        }
    }

    fn snapshot(pairs: &[(&str, &str)]) -> HistorySnapshot {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), VersionString::parse(v).unwrap()))
            .collect::<BTreeMap<_, _>>()
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn names(plan: &BuildPlan) -> Vec<&str> {
        plan.to_build
            .iter()
            .map(|e| e.package.name.as_str())
            .collect()
    }

    #[test]
    fn test_select_never_built_and_newer() {
        let plan = select_packages(
            vec![
                source("fresh", "1.0-1"),
                source("newer", "2.0-1"),
                source("same", "1.0-1"),
                source("older", "1.0~rc1-1"),
            ],
            &snapshot(&[("newer", "1.9-3"), ("same", "1.0-1"), ("older", "1.0-1")]),
            None,
            &BTreeSet::new(),
        );
        assert_eq!(names(&plan), vec!["fresh", "newer"]);
        assert_eq!(plan.skipped.len(), 2);
        assert!(plan.skipped.iter().all(|s| s.reason == SkipReason::UpToDate));
        assert_eq!(plan.to_build[1].previous.as_ref().unwrap().as_str(), "1.9-3");
    }

    #[test]
    fn test_only_overrides_comparison() {
        let plan = select_packages(
            vec![source("a", "1.0"), source("b", "1.0")],
            &snapshot(&[("a", "1.0")]),
            Some("a"),
            &BTreeSet::new(),
        );
        assert_eq!(names(&plan), vec!["a"]);
        assert_eq!(plan.skipped[0].reason, SkipReason::NotSelected);
    }

    #[test]
    fn test_exclude_wins_over_only() {
        let plan = select_packages(
            vec![source("pkgA", "1.0"), source("pkgB", "1.0")],
            &HistorySnapshot::new(),
            Some("pkgA"),
            &set(&["pkgA"]),
        );
        assert!(plan.to_build.is_empty());
    }

    #[test]
    fn test_exclude_list() {
        let plan = select_packages(
            vec![source("a", "1.0"), source("b", "1.0"), source("c", "1.0")],
            &HistorySnapshot::new(),
            None,
            &set(&["b", "c"]),
        );
        assert_eq!(names(&plan), vec!["a"]);
        assert!(plan.skipped.iter().all(|s| s.reason == SkipReason::Excluded));
    }

    #[test]
    fn test_only_unknown_package_selects_nothing() {
        let plan = select_packages(
            vec![source("a", "1.0")],
            &HistorySnapshot::new(),
            Some("zzz"),
            &BTreeSet::new(),
        );
        assert!(plan.to_build.is_empty());
    }

    #[tokio::test]
    async fn test_list_packages_empty_repository() {
        let dir = tempdir().unwrap();
        let manager = SourceRepoManager::new(
            Arc::new(FakeVcs::default()),
            dir.path().to_path_buf(),
            "https://example.org/repo".into(),
            "pristine-tar".into(),
        );
        let err = manager.list_packages().await.unwrap_err();
        assert!(matches!(err, RunError::EmptyRepository { .. }));
    }

    #[tokio::test]
    async fn test_list_packages_malformed_changelog() {
        let dir = tempdir().unwrap();
        let good = write_package(dir.path(), "good", "1.0-1");
        let bad = dir.path().join("bad");
        fs::create_dir_all(&bad).unwrap();
        let manager = SourceRepoManager::new(
            Arc::new(FakeVcs::with_checkouts(vec![good, bad])),
            dir.path().to_path_buf(),
            String::new(),
            "pristine-tar".into(),
        );
        let err = manager.list_packages().await.unwrap_err();
        assert!(matches!(err, RunError::Metadata(_)));
    }

    #[tokio::test]
    async fn test_refresh_clones_when_missing_and_tolerates_branch_failure() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("repo");
        let pkg = write_package(dir.path(), "hello", "1.0-1");
        let vcs = Arc::new(FakeVcs {
            checkouts: Mutex::new(vec![pkg]),
            fail_restore: true,
            ..Default::default()
        });
        let manager = SourceRepoManager::new(
            vcs.clone(),
            root,
            "https://example.org/repo".into(),
            "pristine-tar".into(),
        );
        manager.refresh(false).await.unwrap();

        let calls = vcs.calls();
        assert_eq!(calls[0], "clone_aggregate https://example.org/repo");
        assert_eq!(calls[1], "refresh pull=false");
        assert!(calls[2].starts_with("restore "));

        // Second refresh finds the checkout and does not clone again.
        manager.refresh(true).await.unwrap();
        assert_eq!(vcs.calls()[3], "refresh pull=true");
    }

    #[tokio::test]
    async fn test_plan_uses_history() {
        let dir = tempdir().unwrap();
        let a = write_package(dir.path(), "alpha", "1.0-2");
        let b = write_package(dir.path(), "beta", "3.0-1");
        let manager = SourceRepoManager::new(
            Arc::new(FakeVcs::with_checkouts(vec![a, b])),
            dir.path().to_path_buf(),
            String::new(),
            "pristine-tar".into(),
        );
        let history = HistoryHandle::new(HistoryDb::open_in_memory().unwrap());
        history
            .record(BuildAttempt {
                timestamp: chrono::Utc::now(),
                target: "sid-amd64-sbuild".into(),
                package: "beta".into(),
                version: VersionString::parse("3.0-1").unwrap(),
                outcome: AttemptOutcome::Success,
                stdout: None,
                stderr: None,
            })
            .await
            .unwrap();

        let entries = manager
            .filter_to_build(&history, None, &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].package.name, "alpha");
    }

    #[tokio::test]
    async fn test_working_copy_removed_on_drop() {
        let dir = tempdir().unwrap();
        let src = write_package(dir.path(), "hello", "1.0-1");
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        let manager = SourceRepoManager::new(
            Arc::new(FakeVcs::default()),
            dir.path().to_path_buf(),
            String::new(),
            "pristine-tar".into(),
        );
        let entry = ToBuildEntry {
            package: version::read_package(&src).unwrap(),
            source_location: src,
            previous: None,
        };

        let copy = manager.materialize_working_copy(&entry, &work).await.unwrap();
        assert_eq!(copy.package(), "hello");
        assert!(copy.path().join("debian/changelog").exists());
        let path = copy.path().to_path_buf();
        drop(copy);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_failed_clone_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let src = write_package(dir.path(), "broken", "1.0-1");
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        let manager = SourceRepoManager::new(
            Arc::new(FakeVcs {
                fail_clone_for: Some("broken".into()),
                ..Default::default()
            }),
            dir.path().to_path_buf(),
            String::new(),
            "pristine-tar".into(),
        );
        let entry = ToBuildEntry {
            package: version::read_package(&src).unwrap(),
            source_location: src,
            previous: None,
        };
        assert!(manager.materialize_working_copy(&entry, &work).await.is_err());
        assert!(!work.join("broken").exists());
    }

    #[tokio::test]
    async fn test_reset_working_area() {
        let dir = tempdir().unwrap();
        let area = dir.path().join("area");
        fs::create_dir_all(area.join("hello/.git")).unwrap();
        fs::create_dir_all(area.join("scratch")).unwrap();
        fs::write(area.join("hello_1.0-1_amd64.changes"), "x").unwrap();
        fs::write(area.join("hello_1.0-1_amd64.deb"), "x").unwrap();

        let vcs = Arc::new(FakeVcs::default());
        let manager = SourceRepoManager::new(
            vcs.clone(),
            dir.path().to_path_buf(),
            String::new(),
            "pristine-tar".into(),
        );
        manager.reset_working_area(&area).await.unwrap();

        assert!(!area.join("hello_1.0-1_amd64.changes").exists());
        assert!(!area.join("hello_1.0-1_amd64.deb").exists());
        assert!(area.join("hello").exists());
        assert!(area.join("scratch").exists());
        let calls = vcs.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("clean ") && calls[0].ends_with("hello"));
    }
}
