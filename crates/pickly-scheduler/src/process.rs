//! Stage subprocess execution.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One pipeline stage as an argv list. Never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
}

impl StageCommand {
    pub fn new(
        label: impl Into<String>,
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split `command_line` on whitespace. `None` when it has no program.
    pub fn parse(label: impl Into<String>, command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(label, program, parts))
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process never started or was ended by a signal.
    pub exit_code: Option<i32>,
    pub cancelled: bool,
}

impl ExecutionResult {
    pub fn exit_code_display(&self) -> String {
        self.exit_code
            .map_or_else(|| "none".to_string(), |code| code.to_string())
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion, or until `cancel` fires.
    async fn run(&self, command: &StageCommand, cancel: &CancellationToken) -> ExecutionResult;
}

/// Spawns real child processes in `workdir`, streaming their output to the console.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    workdir: PathBuf,
}

impl ProcessRunner {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Echo and capture child output line by line. Bytes that are not UTF-8 are
/// replaced, and the pipe is always drained to EOF so the child never sees SIGPIPE.
async fn pump<R>(reader: Option<R>, stream: Stream) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut captured = String::new();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf);
                match stream {
                    Stream::Stdout => println!("{line}"),
                    Stream::Stderr => eprintln!("{line}"),
                }
                captured.push_str(&line);
                captured.push('\n');
            }
            Err(err) => {
                warn!(?stream, error = %err, "stopped capturing child output; discarding the rest");
                if let Err(err) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    warn!(?stream, error = %err, "failed to drain child output");
                }
                break;
            }
        }
    }
    captured
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &StageCommand, cancel: &CancellationToken) -> ExecutionResult {
        let started = Instant::now();
        debug!(label = %command.label, command = %command.display(), "spawning stage");

        let spawned = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                warn!(label = %command.label, error = %err, "failed to spawn stage");
                return ExecutionResult {
                    success: false,
                    duration: started.elapsed(),
                    stdout: String::new(),
                    stderr: err.to_string(),
                    exit_code: None,
                    cancelled: false,
                };
            }
        };

        let stdout = tokio::spawn(pump(child.stdout.take(), Stream::Stdout));
        let stderr = tokio::spawn(pump(child.stderr.take(), Stream::Stderr));

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let (status, cancelled) = match waited {
            Some(status) => (status.ok(), false),
            None => {
                warn!(label = %command.label, "cancelling running stage");
                if let Err(err) = child.start_kill() {
                    warn!(error = %err, "failed to kill stage process");
                }
                let _ = child.wait().await;
                (None, true)
            }
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        ExecutionResult {
            success: !cancelled && status.is_some_and(|s| s.success()),
            duration: started.elapsed(),
            stdout,
            stderr,
            exit_code: if cancelled { None } else { status.and_then(|s| s.code()) },
            cancelled,
        }
    }
}
