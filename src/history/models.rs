use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::VersionString;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Failure,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }
}

/// Why a build attempt failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureKind {
    /// The build tool ran and exited non-zero (or was signalled).
    BuildFailed { exit_code: Option<i32> },
    /// The build tool exceeded its time limit and was killed.
    Timeout,
    /// The target chroot was not prepared; nothing was executed.
    EnvironmentNotReady,
    /// The working copy could not be materialized.
    Checkout,
    /// The build tool could not be started.
    Spawn,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildFailed { .. } => "build_failed",
            Self::Timeout => "timeout",
            Self::EnvironmentNotReady => "environment_not_ready",
            Self::Checkout => "checkout",
            Self::Spawn => "spawn",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::BuildFailed { exit_code } => *exit_code,
            _ => None,
        }
    }

    /// Rebuild from the stored columns.
    pub fn from_parts(kind: &str, exit_code: Option<i32>) -> Result<Self, String> {
        match kind {
            "build_failed" => Ok(Self::BuildFailed { exit_code }),
            "timeout" => Ok(Self::Timeout),
            "environment_not_ready" => Ok(Self::EnvironmentNotReady),
            "checkout" => Ok(Self::Checkout),
            "spawn" => Ok(Self::Spawn),
            _ => Err(format!("Invalid failure kind: {}", kind)),
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuildFailed {
                exit_code: Some(code),
            } => write!(f, "build failed (exit {})", code),
            Self::BuildFailed { exit_code: None } => write!(f, "build failed (signal)"),
            Self::Timeout => write!(f, "timed out"),
            Self::EnvironmentNotReady => write!(f, "environment not ready"),
            Self::Checkout => write!(f, "checkout failed"),
            Self::Spawn => write!(f, "build tool could not start"),
        }
    }
}

/// Outcome classification stored with each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum AttemptOutcome {
    Success,
    Failure(FailureKind),
}

impl AttemptOutcome {
    pub fn status(&self) -> BuildStatus {
        match self {
            Self::Success => BuildStatus::Success,
            Self::Failure(_) => BuildStatus::Failure,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            Self::Success => None,
            Self::Failure(kind) => Some(*kind),
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure(kind) => write!(f, "failure: {}", kind),
        }
    }
}

/// One build attempt, as handed to the store for recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAttempt {
    pub timestamp: DateTime<Utc>,
    /// Chroot name of the target, e.g. `stretch-amd64-sbuild`.
    pub target: String,
    pub package: String,
    pub version: VersionString,
    pub outcome: AttemptOutcome,
    #[serde(skip)]
    pub stdout: Option<Vec<u8>>,
    #[serde(skip)]
    pub stderr: Option<Vec<u8>>,
}

/// A recorded attempt read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt sequence; strictly increasing in insertion order.
    pub id: i64,
    #[serde(flatten)]
    pub attempt: BuildAttempt,
}

/// Latest successfully built version of a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltPackage {
    pub name: String,
    pub version: VersionString,
    pub attempt_id: i64,
    pub built_at: DateTime<Utc>,
}
