//! Typed invocation of external tools.
//!
//! Commands are built from an argument vector, never from a shell string, so
//! database names and paths cannot inject anything. The [`CommandRunner`]
//! trait is the seam tests replace.

use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Longest stderr excerpt carried into an error message.
const STDERR_EXCERPT: usize = 2048;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
    /// Receives the child's stdout instead of capturing it
    pub stdout_file: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn stdout_file(mut self, path: impl AsRef<Path>) -> Self {
        self.stdout_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Program and arguments, for logs. Environment values are never shown.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("command", &self.display())
            .field(
                "envs",
                &self.envs.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            )
            .field("stdout_file", &self.stdout_file)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Why a command did not succeed.
#[derive(Debug)]
pub enum CommandFailure {
    Spawn(std::io::Error),
    Exit { code: Option<i32>, stderr: String },
    TimedOut(Duration),
    Cancelled,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to start: {e}"),
            Self::Exit { code, stderr } => match code {
                Some(code) => write!(f, "exited with status {code}: {}", stderr.trim()),
                None => write!(f, "terminated by signal: {}", stderr.trim()),
            },
            Self::TimedOut(d) => write!(f, "timed out after {}s", d.as_secs()),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl CommandFailure {
    /// Map into the engine taxonomy. Timeouts and cancellation keep their own
    /// variants; everything else becomes the stage error built by `wrap`.
    pub fn into_backup_error(
        self,
        stage: &str,
        wrap: impl FnOnce(String) -> BackupError,
    ) -> BackupError {
        match self {
            Self::TimedOut(d) => BackupError::Timeout {
                stage: stage.to_string(),
                secs: d.as_secs(),
            },
            Self::Cancelled => BackupError::Cancelled,
            other => wrap(other.to_string()),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<CommandOutput, CommandFailure>;
}

/// Runs commands as child processes; the child is killed on timeout or cancellation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<CommandOutput, CommandFailure> {
        debug!(command = %spec.display(), "Spawning");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match &spec.stdout_file {
            Some(path) => {
                let file = std::fs::File::create(path).map_err(CommandFailure::Spawn)?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }

        let mut child = cmd.spawn().map_err(CommandFailure::Spawn)?;
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        // Both pipes are drained concurrently so a chatty stderr cannot stall stdout.
        let collect = async {
            let read_stdout = async {
                let mut buf = String::new();
                if let Some(pipe) = stdout_pipe.as_mut() {
                    let _ = pipe.read_to_string(&mut buf).await;
                }
                buf
            };
            let read_stderr = async {
                let mut buf = String::new();
                if let Some(pipe) = stderr_pipe.as_mut() {
                    let _ = pipe.read_to_string(&mut buf).await;
                }
                buf
            };
            tokio::join!(read_stdout, read_stderr)
        };

        let outcome = tokio::select! {
            res = async {
                let (stdout, stderr) = collect.await;
                (child.wait().await, stdout, stderr)
            } => Some(res),
            _ = tokio::time::sleep(timeout) => None,
            _ = cancel.cancelled() => {
                return Err(CommandFailure::Cancelled);
            }
        };

        let (status, stdout, stderr) = match outcome {
            Some(res) => res,
            None => return Err(CommandFailure::TimedOut(timeout)),
        };
        let status = status.map_err(CommandFailure::Spawn)?;

        if !status.success() {
            return Err(CommandFailure::Exit {
                code: status.code(),
                stderr: excerpt(&stderr),
            });
        }

        Ok(CommandOutput {
            status_code: status.code(),
            stdout,
            stderr,
        })
    }
}

fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_EXCERPT {
        return trimmed.to_string();
    }
    let mut end = STDERR_EXCERPT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
