//! sbuild chroots as build targets.
//!
//! Each [`BuildEnvironment`] wraps one chroot (`<suite>-<arch>-<suffix>`) and
//! its readiness. A per-target async mutex is held for the whole of every
//! `prepare` and `build`, so at most one operation touches a chroot at a
//! time while different chroots proceed independently.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::SbuildConfig;
use crate::errors::{EnvironmentError, PreparePhase, ProcessError};
use crate::history::{AttemptOutcome, FailureKind};
use crate::process::{CommandRunner, CommandSpec, ProcessOutput};

/// Limit for `sbuild-update` (package lists).
pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Limit for `sbuild-update --dist-upgrade`.
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// An (architecture, suite) pair and the chroot that serves it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BuildTarget {
    pub arch: String,
    pub suite: String,
    chroot: String,
}

impl BuildTarget {
    pub fn new(arch: &str, suite: &str, suffix: &str) -> Self {
        Self {
            arch: arch.to_string(),
            suite: suite.to_string(),
            chroot: format!("{}-{}-{}", suite, arch, suffix),
        }
    }

    pub fn chroot(&self) -> &str {
        &self.chroot
    }
}

impl std::fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.chroot)
    }
}

/// Readiness of a chroot. Only `Ready` allows builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// Not prepared since process start.
    Unknown,
    Ready,
    /// The last prepare failed.
    Stale,
}

impl Readiness {
    pub fn is_ready(self) -> bool {
        self == Readiness::Ready
    }
}

/// Captured result of one build invocation.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub outcome: AttemptOutcome,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl BuildOutcome {
    /// Classify a finished build tool invocation.
    pub fn classify(result: Result<ProcessOutput, ProcessError>, elapsed: Duration) -> Self {
        match result {
            Ok(output) => Self {
                outcome: AttemptOutcome::Success,
                stdout: output.stdout,
                stderr: output.stderr,
                duration: output.duration,
            },
            Err(ProcessError::Failed {
                exit_code,
                stdout,
                stderr,
                ..
            }) => Self {
                outcome: AttemptOutcome::Failure(FailureKind::BuildFailed { exit_code }),
                stdout,
                stderr,
                duration: elapsed,
            },
            Err(ProcessError::Timeout {
                timeout,
                stdout,
                mut stderr,
                ..
            }) => {
                stderr.extend_from_slice(
                    format!("build killed after {}s\n", timeout.as_secs()).as_bytes(),
                );
                Self {
                    outcome: AttemptOutcome::Failure(FailureKind::Timeout),
                    stdout,
                    stderr,
                    duration: elapsed,
                }
            }
            Err(err @ ProcessError::SpawnFailed { .. }) => Self {
                outcome: AttemptOutcome::Failure(FailureKind::Spawn),
                stdout: Vec::new(),
                stderr: format!("{}\n", err).into_bytes(),
                duration: elapsed,
            },
        }
    }
}

pub struct BuildEnvironment {
    target: BuildTarget,
    runner: Arc<dyn CommandRunner>,
    readiness: Mutex<Readiness>,
    output_dir: Option<PathBuf>,
    build_timeout: Duration,
}

impl BuildEnvironment {
    pub fn new(
        target: BuildTarget,
        runner: Arc<dyn CommandRunner>,
        output_dir: Option<PathBuf>,
        build_timeout: Duration,
    ) -> Self {
        Self {
            target,
            runner,
            readiness: Mutex::new(Readiness::Unknown),
            output_dir,
            build_timeout,
        }
    }

    pub fn target(&self) -> &BuildTarget {
        &self.target
    }

    pub async fn readiness(&self) -> Readiness {
        *self.readiness.lock().await
    }

    /// Mark the chroot ready without updating it.
    pub async fn assume_ready(&self) {
        *self.readiness.lock().await = Readiness::Ready;
        tracing::debug!(chroot = self.target.chroot(), "assuming chroot is ready");
    }

    /// Update the package lists, then dist-upgrade the chroot.
    pub async fn prepare(&self) -> Result<(), EnvironmentError> {
        let mut readiness = self.readiness.lock().await;
        let chroot = self.target.chroot();

        let steps = [
            (
                PreparePhase::Update,
                CommandSpec::new("sbuild-update")
                    .arg(chroot)
                    .timeout(UPDATE_TIMEOUT),
            ),
            (
                PreparePhase::DistUpgrade,
                CommandSpec::new("sbuild-update")
                    .args(["--dist-upgrade", chroot])
                    .timeout(UPGRADE_TIMEOUT),
            ),
        ];

        for (phase, spec) in steps {
            tracing::info!(chroot, %phase, "preparing chroot");
            if let Err(cause) = self.runner.run(&spec).await {
                *readiness = Readiness::Stale;
                tracing::error!(chroot, %phase, error = %cause, "chroot preparation failed");
                return Err(EnvironmentError::PrepareFailed {
                    target: chroot.to_string(),
                    phase,
                    cause,
                });
            }
        }

        *readiness = Readiness::Ready;
        tracing::info!(chroot, "chroot ready");
        Ok(())
    }

    /// Run sbuild on a working copy for this target's arch and suite.
    ///
    /// Fails with `NotReady` without running anything unless the last
    /// prepare succeeded. Build failures are returned inside the outcome.
    pub async fn build(&self, working_copy: &Path) -> Result<BuildOutcome, EnvironmentError> {
        let readiness = self.readiness.lock().await;
        if !readiness.is_ready() {
            return Err(EnvironmentError::NotReady {
                target: self.target.chroot().to_string(),
            });
        }

        let mut spec = CommandSpec::new("sbuild").args([
            format!("--dist={}", self.target.suite),
            format!("--arch={}", self.target.arch),
        ]);
        if let Some(dir) = &self.output_dir {
            spec = spec.arg(format!("--build-dir={}", dir.display()));
        }
        spec = spec
            .arg(working_copy.to_string_lossy())
            .timeout(self.build_timeout);
        if let Some(parent) = working_copy.parent() {
            spec = spec.current_dir(parent);
        }

        let started = Instant::now();
        let outcome = BuildOutcome::classify(self.runner.run(&spec).await, started.elapsed());
        drop(readiness);
        Ok(outcome)
    }
}

/// Every configured target: the cross product of suites and arches.
pub struct EnvironmentPool {
    environments: Vec<Arc<BuildEnvironment>>,
}

impl EnvironmentPool {
    pub fn from_config(config: &SbuildConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let environments = config
            .suites
            .iter()
            .flat_map(|suite| {
                config
                    .arches
                    .iter()
                    .map(move |arch| BuildTarget::new(arch, suite, &config.chroot_suffix))
            })
            .map(|target| {
                Arc::new(BuildEnvironment::new(
                    target,
                    runner.clone(),
                    config.output_dir.clone(),
                    config.build_timeout,
                ))
            })
            .collect();
        Self { environments }
    }

    pub fn environments(&self) -> &[Arc<BuildEnvironment>] {
        &self.environments
    }

    pub fn targets(&self) -> Vec<BuildTarget> {
        self.environments
            .iter()
            .map(|env| env.target().clone())
            .collect()
    }

    /// Prepare every target concurrently. A failed target stays unready and
    /// does not affect the others.
    pub async fn prepare_all(&self) -> Vec<(BuildTarget, Result<(), EnvironmentError>)> {
        let preparations = self.environments.iter().map(|env| async move {
            let result = env.prepare().await;
            (env.target().clone(), result)
        });
        futures::future::join_all(preparations).await
    }
}
