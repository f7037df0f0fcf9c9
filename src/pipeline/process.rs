//! Bounded external process execution shared by the bootstrapper and the
//! rasterizer.
//!
//! Both wait at most a fixed time for the child. What happens to a child that
//! outlives the wait depends on the caller:
//!
//! * [`run_bounded`] kills it. Install steps must not keep running behind
//!   the run's back.
//! * [`run_abandoning`] leaves it running and reaps it from a detached task.
//!   A slow rasterisation may still finish, and its images are picked up by
//!   a later discovery scan.

use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started (not on `PATH`, not executable, …).
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' did not finish within {secs}s")]
    TimedOut { program: String, secs: u64 },
}

impl ProcessError {
    /// `true` when the program does not exist at all.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// What to do with a child still running when the timeout elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnTimeout {
    Kill,
    Abandon,
}

/// Run `program args…` to completion, capturing stdout and stderr, for at most
/// `timeout`. A child still running at the deadline is killed.
pub async fn run_bounded(
    program: &str,
    args: &[&str],
    envs: &[(&str, &str)],
    timeout: Duration,
) -> Result<Output, ProcessError> {
    run(program, args, envs, timeout, OnTimeout::Kill).await
}

/// Like [`run_bounded`], but a child still running at the deadline is left to
/// finish on its own. Its output is discarded.
pub async fn run_abandoning(
    program: &str,
    args: &[&str],
    envs: &[(&str, &str)],
    timeout: Duration,
) -> Result<Output, ProcessError> {
    run(program, args, envs, timeout, OnTimeout::Abandon).await
}

async fn run(
    program: &str,
    args: &[&str],
    envs: &[(&str, &str)],
    timeout: Duration,
    on_timeout: OnTimeout,
) -> Result<Output, ProcessError> {
    let spawn_error = |source| ProcessError::Spawn {
        program: program.to_string(),
        source,
    };

    let mut child = Command::new(program)
        .args(args)
        .envs(envs.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(on_timeout == OnTimeout::Kill)
        .spawn()
        .map_err(spawn_error)?;

    // Drain both pipes concurrently so a chatty child never blocks on a full
    // pipe, including after it has been abandoned.
    let stdout = child.stdout.take().map(|r| tokio::spawn(read_to_end(r)));
    let stderr = child.stderr.take().map(|r| tokio::spawn(read_to_end(r)));

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    match waited {
        Ok(Ok(status)) => Ok(Output {
            status,
            stdout: collect(stdout).await,
            stderr: collect(stderr).await,
        }),
        Ok(Err(source)) => Err(spawn_error(source)),
        Err(_) => {
            if on_timeout == OnTimeout::Abandon {
                debug!("Leaving '{}' running after {:?}", program, timeout);
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(ProcessError::TimedOut {
                program: program.to_string(),
                secs: timeout.as_secs(),
            })
        }
    }
}

async fn read_to_end<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    buf
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match handle {
        Some(h) => h.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

/// Last non-empty line of a captured stream, for compact log messages.
pub fn tail_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string()
}
