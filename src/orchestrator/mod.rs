//! Run orchestration: refresh, plan, dispatch, record.
//!
//! A run moves through `Idle → Refreshing → Planning → Dispatching →
//! Recording → Idle`. Dispatch spawns one worker per build target; a worker
//! builds its queue strictly in order, so a chroot never hosts two builds,
//! while different chroots run in parallel. Every (package, target) pair
//! that is attempted is recorded before its working copy is discarded.
//!
//! Failures of a single pair are recorded and never abort the run. Only
//! refresh, planning and storage errors do.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{DebrisConfig, PackageTargets};
use crate::environment::{BuildEnvironment, BuildOutcome, BuildTarget, EnvironmentPool};
use crate::errors::{EnvironmentError, HistoryError, RunError};
use crate::history::{AttemptOutcome, BuildAttempt, FailureKind, HistoryHandle};
use crate::process::CommandRunner;
use crate::source::{GitVcs, SkippedPackage, SourceRepoManager, ToBuildEntry};
use crate::version::VersionString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Refreshing,
    Planning,
    Dispatching,
    Recording,
    Aborted,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Refreshing => "refreshing",
            RunPhase::Planning => "planning",
            RunPhase::Dispatching => "dispatching",
            RunPhase::Recording => "recording",
            RunPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Per-run knobs, usually from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Build exactly this package, whatever its version.
    pub only: Option<String>,
    pub exclude: BTreeSet<String>,
    /// Pull from the remote before resetting.
    pub pull: bool,
    /// Trust the chroots as they are instead of updating them.
    pub skip_prepare: bool,
}

/// Outcome of one attempted (package, target) pair.
#[derive(Debug, Clone, Serialize)]
pub struct PairResult {
    pub package: String,
    pub version: VersionString,
    pub target: String,
    pub outcome: AttemptOutcome,
    pub attempt_id: i64,
}

/// A pair that was planned but never started.
#[derive(Debug, Clone, Serialize)]
pub struct UnattemptedPair {
    pub package: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrepareFailure {
    pub target: String,
    pub error: String,
}

/// What a run did, for the final report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub skipped: Vec<SkippedPackage>,
    pub results: Vec<PairResult>,
    pub not_attempted: Vec<UnattemptedPair>,
    pub prepare_failures: Vec<PrepareFailure>,
    /// Interrupted mid-dispatch; in-flight pairs were still recorded.
    pub cancelled: bool,
}

impl RunSummary {
    pub fn built(&self) -> impl Iterator<Item = &PairResult> {
        self.results.iter().filter(|r| r.outcome.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &PairResult> {
        self.results.iter().filter(|r| !r.outcome.is_success())
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some() || !self.prepare_failures.is_empty()
    }
}

enum WorkerReport {
    Attempted(PairResult),
    NotAttempted(UnattemptedPair),
    StorageFailed {
        package: String,
        target: String,
        error: HistoryError,
    },
}

pub struct Orchestrator {
    source: Arc<SourceRepoManager>,
    pool: EnvironmentPool,
    history: HistoryHandle,
    packages: BTreeMap<String, PackageTargets>,
    work_dir: Option<PathBuf>,
    cancel: CancellationToken,
    phase: RunPhase,
}

impl Orchestrator {
    pub fn new(
        source: SourceRepoManager,
        pool: EnvironmentPool,
        history: HistoryHandle,
        packages: BTreeMap<String, PackageTargets>,
        work_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            source: Arc::new(source),
            pool,
            history,
            packages,
            work_dir,
            cancel: CancellationToken::new(),
            phase: RunPhase::Idle,
        }
    }

    /// Wire the real git and sbuild collaborators from configuration.
    pub fn from_config(
        config: &DebrisConfig,
        runner: Arc<dyn CommandRunner>,
        history: HistoryHandle,
    ) -> Self {
        let source = SourceRepoManager::new(
            Arc::new(GitVcs::new(runner.clone())),
            config.repo.local.clone(),
            config.repo.url.clone(),
            config.repo.aux_branch.clone(),
        );
        let pool = EnvironmentPool::from_config(&config.sbuild, runner);
        Self::new(
            source,
            pool,
            history,
            config.packages.clone(),
            config.work_dir.clone(),
        )
    }

    /// Use an externally owned token (e.g. wired to Ctrl-C).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn source(&self) -> &SourceRepoManager {
        &self.source
    }

    pub fn pool(&self) -> &EnvironmentPool {
        &self.pool
    }

    fn enter(&mut self, phase: RunPhase) {
        tracing::debug!(from = %self.phase, to = %phase, "run phase");
        self.phase = phase;
    }

    /// Prepare every target without building anything.
    pub async fn update_environments(&self) -> Vec<(BuildTarget, Result<(), EnvironmentError>)> {
        self.pool.prepare_all().await
    }

    /// Execute one full run.
    pub async fn run(&mut self, options: &RunOptions) -> Result<RunSummary, RunError> {
        match self.run_phases(options).await {
            Ok(summary) => {
                self.enter(RunPhase::Idle);
                Ok(summary)
            }
            Err(e) => {
                self.enter(RunPhase::Aborted);
                tracing::error!(error = %e, "run aborted");
                Err(e)
            }
        }
    }

    async fn run_phases(&mut self, options: &RunOptions) -> Result<RunSummary, RunError> {
        self.enter(RunPhase::Refreshing);
        self.source.refresh(options.pull).await?;
        self.ensure_not_cancelled()?;

        self.enter(RunPhase::Planning);
        let plan = self
            .source
            .plan(&self.history, options.only.as_deref(), &options.exclude)
            .await?;
        tracing::info!(
            to_build = plan.to_build.len(),
            skipped = plan.skipped.len(),
            "planning complete"
        );

        let mut summary = RunSummary {
            skipped: plan.skipped,
            ..Default::default()
        };
        if plan.to_build.is_empty() {
            tracing::info!("nothing to build");
            return Ok(summary);
        }

        if options.skip_prepare {
            for env in self.pool.environments() {
                env.assume_ready().await;
            }
        } else {
            for (target, result) in self.pool.prepare_all().await {
                if let Err(e) = result {
                    summary.prepare_failures.push(PrepareFailure {
                        target: target.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        self.ensure_not_cancelled()?;

        self.enter(RunPhase::Dispatching);
        self.dispatch(plan.to_build, &mut summary).await?;
        summary.cancelled = self.cancel.is_cancelled();
        Ok(summary)
    }

    fn ensure_not_cancelled(&self) -> Result<(), RunError> {
        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        Ok(())
    }

    fn queue_for(&self, target: &BuildTarget, entries: &[ToBuildEntry]) -> Vec<ToBuildEntry> {
        entries
            .iter()
            .filter(|entry| {
                self.packages
                    .get(&entry.package.name)
                    .is_none_or(|t| t.allows(&target.arch, &target.suite))
            })
            .cloned()
            .collect()
    }

    async fn dispatch(
        &mut self,
        entries: Vec<ToBuildEntry>,
        summary: &mut RunSummary,
    ) -> Result<(), RunError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("debris-run-");
        let run_dir = match &self.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(RunError::WorkingArea)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
        .map_err(RunError::WorkingArea)?;

        // Storage errors stop new work without touching the caller's token.
        let stop = self.cancel.child_token();
        let (report_tx, mut report_rx) = mpsc::channel::<WorkerReport>(64);

        // All target areas are created before the first worker is spawned.
        let mut workers = Vec::new();
        for env in self.pool.environments() {
            let queue = self.queue_for(env.target(), &entries);
            if queue.is_empty() {
                continue;
            }
            let target_root = run_dir.path().join(env.target().chroot());
            std::fs::create_dir_all(&target_root).map_err(RunError::WorkingArea)?;

            let worker = TargetWorker {
                env: env.clone(),
                source: self.source.clone(),
                history: self.history.clone(),
                target_root,
                stop: stop.clone(),
                reports: report_tx.clone(),
            };
            workers.push((worker, queue));
        }
        let handles: Vec<_> = workers
            .into_iter()
            .map(|(worker, queue)| tokio::spawn(worker.run(queue)))
            .collect();
        drop(report_tx);

        self.enter(RunPhase::Recording);
        let mut storage_error = None;
        while let Some(report) = report_rx.recv().await {
            match report {
                WorkerReport::Attempted(result) => summary.results.push(result),
                WorkerReport::NotAttempted(pair) => summary.not_attempted.push(pair),
                WorkerReport::StorageFailed {
                    package,
                    target,
                    error,
                } => {
                    tracing::error!(%package, chroot = %target, error = %error, "failed to record attempt, stopping dispatch");
                    stop.cancel();
                    storage_error.get_or_insert(error);
                }
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "build worker panicked");
            }
        }
        drop(run_dir);

        match storage_error {
            Some(e) => Err(RunError::History(e)),
            None => Ok(()),
        }
    }
}

/// Builds one target's queue in order.
struct TargetWorker {
    env: Arc<BuildEnvironment>,
    source: Arc<SourceRepoManager>,
    history: HistoryHandle,
    target_root: PathBuf,
    stop: CancellationToken,
    reports: mpsc::Sender<WorkerReport>,
}

impl TargetWorker {
    async fn run(self, queue: Vec<ToBuildEntry>) {
        let chroot = self.env.target().chroot().to_string();

        for entry in queue {
            if self.stop.is_cancelled() {
                self.send(WorkerReport::NotAttempted(UnattemptedPair {
                    package: entry.package.name.clone(),
                    target: chroot.clone(),
                }))
                .await;
                continue;
            }

            let package = entry.package.name.clone();
            tracing::info!(%package, version = %entry.package.version, %chroot, "building");
            let (attempt, working_copy) = self.attempt(&entry).await;
            let outcome = attempt.outcome;

            let report = match self.history.record(attempt).await {
                Ok(attempt_id) => {
                    tracing::info!(%package, %chroot, %outcome, attempt_id, "recorded attempt");
                    WorkerReport::Attempted(PairResult {
                        package,
                        version: entry.package.version.clone(),
                        target: chroot.clone(),
                        outcome,
                        attempt_id,
                    })
                }
                Err(error) => {
                    self.stop.cancel();
                    WorkerReport::StorageFailed {
                        package,
                        target: chroot.clone(),
                        error,
                    }
                }
            };

            drop(working_copy);
            if let Err(e) = self.source.reset_working_area(&self.target_root).await {
                tracing::warn!(%chroot, error = %e, "failed to reset working area");
            }
            self.send(report).await;
        }
    }

    async fn send(&self, report: WorkerReport) {
        if self.reports.send(report).await.is_err() {
            tracing::warn!("run summary receiver dropped");
        }
    }

    async fn attempt(
        &self,
        entry: &ToBuildEntry,
    ) -> (BuildAttempt, Option<crate::source::WorkingCopy>) {
        let mut attempt = BuildAttempt {
            timestamp: Utc::now(),
            target: self.env.target().chroot().to_string(),
            package: entry.package.name.clone(),
            version: entry.package.version.clone(),
            outcome: AttemptOutcome::Success,
            stdout: None,
            stderr: None,
        };

        let working_copy = match self
            .source
            .materialize_working_copy(entry, &self.target_root)
            .await
        {
            Ok(wc) => wc,
            Err(e) => {
                tracing::warn!(package = %entry.package.name, error = %e, "could not materialize working copy");
                attempt.outcome = AttemptOutcome::Failure(FailureKind::Checkout);
                attempt.stderr = Some(format!("{}\n", e).into_bytes());
                return (attempt, None);
            }
        };

        match self.env.build(working_copy.path()).await {
            Ok(BuildOutcome {
                outcome,
                stdout,
                stderr,
                duration,
            }) => {
                tracing::debug!(package = %entry.package.name, elapsed_secs = duration.as_secs(), %outcome, "build finished");
                attempt.outcome = outcome;
                attempt.stdout = Some(stdout);
                attempt.stderr = Some(stderr);
            }
            Err(e) => {
                tracing::warn!(package = %entry.package.name, error = %e, "build not attempted");
                attempt.outcome = AttemptOutcome::Failure(FailureKind::EnvironmentNotReady);
                attempt.stderr = Some(format!("{}\n", e).into_bytes());
            }
        }
        (attempt, Some(working_copy))
    }
}
