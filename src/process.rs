//! External command execution.
//!
//! Every command debris runs (git, sbuild, sbuild-update) goes through a
//! [`CommandRunner`]. The system implementation spawns the process with
//! captured output and an optional timeout; on timeout the child is killed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;

use crate::errors::ProcessError;

/// A command to run: program, arguments, working directory and time limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Shell-like rendering for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output of a command that exited successfully.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion.
    ///
    /// A non-zero exit is returned as `ProcessError::Failed`, never as `Ok`.
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProcessError>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }

        tracing::debug!(command = %spec.display(), timeout_secs = ?spec.timeout.map(|t| t.as_secs()), "spawning");

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            program: spec.program.clone(),
            source,
        })?;

        // Pipes are drained into buffers the caller keeps, so a timeout still
        // leaves whatever the child wrote before it was killed.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let waited = {
            let collect = async {
                let (status, out, err) = tokio::join!(
                    child.wait(),
                    drain(stdout_pipe, &mut stdout),
                    drain(stderr_pipe, &mut stderr)
                );
                out.and(err).and(status)
            };
            match spec.timeout {
                Some(limit) => timeout(limit, collect).await.map_err(|_| limit),
                None => Ok(collect.await),
            }
        };

        let status = match waited {
            Ok(result) => result.map_err(|source| ProcessError::SpawnFailed {
                program: spec.program.clone(),
                source,
            })?,
            Err(limit) => {
                tracing::warn!(command = %spec.display(), timeout_secs = limit.as_secs(), "command timed out, killed");
                if let Err(e) = child.start_kill() {
                    tracing::debug!(command = %spec.display(), error = %e, "kill after timeout failed");
                }
                return Err(ProcessError::Timeout {
                    program: spec.program.clone(),
                    timeout: limit,
                    stdout,
                    stderr,
                });
            }
        };

        let duration = start.elapsed();
        tracing::debug!(
            command = %spec.display(),
            exit_code = ?status.code(),
            elapsed_ms = duration.as_millis() as u64,
            "command finished"
        );

        if !status.success() {
            return Err(ProcessError::Failed {
                program: spec.program.clone(),
                exit_code: status.code(),
                stdout,
                stderr,
            });
        }

        Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(0),
            stdout,
            stderr,
            duration,
        })
    }
}

/// Read a child pipe to EOF, appending to `out` chunk by chunk.
async fn drain<R>(pipe: Option<R>, out: &mut Vec<u8>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    let mut buf = [0u8; 8192];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        out.extend_from_slice(&buf[..n]);
    }
}
