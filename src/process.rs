//! Running external CLI tools
//!
//! Output is exposed as a lazy stream of trimmed stdout lines. The child
//! only runs to completion when the stream is drained; a non-zero exit is
//! reported as the last item of the stream, after every line it printed.
//!
//! Children are spawned with `kill_on_drop`, so abandoning a stream early
//! (a `break`, an early `?`, a dropped future) kills and reaps the process
//! and closes its pipes.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {}: {stderr}", display_code(.exit_code))]
    Exit {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed reading output of {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "<signal>".to_string())
}

impl ProcessError {
    /// Exit code of the process, if it ran and exited normally
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::Exit { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// Captured stderr (empty unless the process exited non-zero)
    pub fn stderr(&self) -> &str {
        match self {
            ProcessError::Exit { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// Lazy stream of output lines; the final item is an error on non-zero exit
pub type LineStream = BoxStream<'static, Result<String, ProcessError>>;

struct Running {
    program: String,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stderr: Option<JoinHandle<String>>,
}

impl Running {
    async fn finish(mut self) -> Result<(), ProcessError> {
        let status = self.child.wait().await.map_err(|source| ProcessError::Io {
            program: self.program.clone(),
            source,
        })?;

        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            debug!(program = %self.program, "Process finished");
            Ok(())
        } else {
            Err(ProcessError::Exit {
                program: self.program,
                exit_code: status.code(),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

/// Spawn `program` and stream its stdout line by line
///
/// `envs` are layered on top of the inherited environment.
pub fn run_lines<I, S>(
    program: &Path,
    args: I,
    envs: &[(String, String)],
) -> Result<LineStream, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let display = program.display().to_string();
    let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();

    let mut cmd = Command::new(program);
    cmd.args(&args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(program = %program.display(), args = ?args, "Spawning process");

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: display.clone(),
        source,
    })?;

    let stdout = child.stdout.take().ok_or_else(|| ProcessError::Io {
        program: display.clone(),
        source: std::io::Error::other("stdout was not captured"),
    })?;

    // drain stderr concurrently so a chatty child never blocks on a full pipe
    let stderr = child.stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    let running = Running {
        program: display,
        child,
        lines: BufReader::new(stdout).lines(),
        stderr,
    };

    let lines = stream::unfold(Some(running), |state| async move {
        let mut running = state?;
        match running.lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line.trim().to_string()), Some(running))),
            Ok(None) => match running.finish().await {
                Ok(()) => None,
                Err(e) => Some((Err(e), None)),
            },
            Err(source) => {
                let program = running.program.clone();
                Some((Err(ProcessError::Io { program, source }), None))
            }
        }
    });

    Ok(lines.boxed())
}

/// Run `program` to completion and collect every output line
pub async fn run_collect<I, S>(
    program: &Path,
    args: I,
    envs: &[(String, String)],
) -> Result<Vec<String>, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_lines(program, args, envs)?.try_collect().await
}

/// Run `program` to completion and return its raw stdout
///
/// Unlike [`run_lines`] nothing is trimmed, for output whose indentation
/// matters (YAML documents).
pub async fn run_output<I, S>(
    program: &Path,
    args: I,
    envs: &[(String, String)],
) -> Result<String, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let display = program.display().to_string();

    let output = Command::new(program)
        .args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ProcessError::Spawn {
            program: display.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(ProcessError::Exit {
            program: display,
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
