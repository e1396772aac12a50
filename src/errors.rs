//! Typed error hierarchy for debris.
//!
//! One enum per subsystem, plus `RunError` which is the only error a whole
//! run can end with:
//! - `ConfigError`: layered configuration resolution
//! - `MetadataError`: `debian/changelog` and version parsing
//! - `ProcessError`: external command execution
//! - `VcsError`: git operations on the aggregate checkout
//! - `EnvironmentError`: sbuild chroot lifecycle
//! - `HistoryError`: the SQLite build history
//! - `RunError`: run-level aborts

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from configuration resolution.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration key '{key}' not recognized or not set")]
    KeyNotRecognized { key: String },

    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Errors from reading packaging metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Malformed packaging metadata at {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Invalid version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },
}

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The child was killed; `stdout`/`stderr` hold what it wrote until then.
    #[error("'{program}' timed out after {}s", .timeout.as_secs())]
    Timeout {
        program: String,
        timeout: Duration,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    #[error("'{program}' exited with {}", describe_exit(.exit_code))]
    Failed {
        program: String,
        exit_code: Option<i32>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git command '{command}' failed: {exit_info}")]
    OperationFailed { command: String, exit_info: String },

    #[error("git error at {path}: {source}")]
    Git {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl VcsError {
    pub(crate) fn from_process(command: String, err: ProcessError) -> Self {
        let exit_info = match &err {
            ProcessError::Failed { stderr, .. } => {
                let stderr = String::from_utf8_lossy(stderr);
                format!("{} ({})", err, stderr.trim())
            }
            _ => err.to_string(),
        };
        VcsError::OperationFailed { command, exit_info }
    }
}

/// Which step of chroot preparation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparePhase {
    Update,
    DistUpgrade,
}

impl std::fmt::Display for PreparePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreparePhase::Update => write!(f, "update"),
            PreparePhase::DistUpgrade => write!(f, "dist-upgrade"),
        }
    }
}

/// Errors from the sbuild environment pool.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("Preparing {target} failed during {phase}: {cause}")]
    PrepareFailed {
        target: String,
        phase: PreparePhase,
        #[source]
        cause: ProcessError,
    },

    #[error("Build environment {target} is not ready")]
    NotReady { target: String },
}

/// Errors from the build history database.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database task panicked")]
    TaskPanicked,

    #[error("Corrupt history row {id}: {reason}")]
    CorruptRow { id: i64, reason: String },
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Another debris run holds {path} ({holder})")]
    AlreadyRunning { path: PathBuf, holder: String },

    #[error("Failed to open lock file {path}: {source}")]
    LockFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Aggregate checkout at {root} contains no packages")]
    EmptyRepository { root: PathBuf },

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("Failed to create working area: {0}")]
    WorkingArea(#[source] std::io::Error),

    #[error("Run cancelled before dispatch")]
    Cancelled,
}

impl RunError {
    /// Process exit code for an aborted run.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::AlreadyRunning { .. } => 2,
            RunError::Cancelled => 130,
            _ => 1,
        }
    }
}
