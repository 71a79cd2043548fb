//! Child process spawning, output capture and exit tracking.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{LlamadError, Result};

/// Everything needed to launch one child.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One captured line of child output.
#[derive(Debug, Clone, Serialize)]
pub struct OutputLine {
    pub service: String,
    pub stream: OutputStream,
    pub line: String,
}

/// How a child ended. Exactly one is published per spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Exit code present and non-zero. A signal-terminated child has no code
    /// and is not treated as a crash.
    #[must_use]
    pub fn is_crash(&self) -> bool {
        self.code.is_some_and(|c| c != 0)
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Signals a handle can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    Terminate,
    Interrupt,
    /// Uncatchable; goes through the runtime so the child is reaped.
    Kill,
}

/// Owned handle to a running (or finished) child.
///
/// The `Child` itself lives in a monitor task that waits on it; the handle
/// talks to that task and observes its exit through a watch channel.
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::Sender<()>,
    io_tasks: Vec<JoinHandle<()>>,
}

/// Spawn `spec`, forwarding every output line to `output`.
///
/// An `Err` here is the spawn-error terminal event; on `Ok` the exit is
/// published later through [`ProcessHandle::wait`].
pub fn spawn(spec: &LaunchSpec, output: broadcast::Sender<OutputLine>) -> Result<ProcessHandle> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|e| LlamadError::Spawn {
        service: spec.name.clone(),
        reason: format!("{} ({e})", spec.program.display()),
    })?;

    let pid = child.id();
    log::info!(
        "{} spawned (PID: {})",
        spec.name,
        pid.map_or("unavailable".to_string(), |p| p.to_string())
    );

    let mut io_tasks = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        io_tasks.push(tokio::spawn(forward_lines(
            spec.name.clone(),
            OutputStream::Stdout,
            stdout,
            output.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        io_tasks.push(tokio::spawn(forward_lines(
            spec.name.clone(),
            OutputStream::Stderr,
            stderr,
            output,
        )));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, mut kill_rx) = mpsc::channel::<()>(4);
    let name = spec.name.clone();

    tokio::spawn(async move {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                req = kill_rx.recv() => match req {
                    Some(()) => {
                        if let Err(e) = child.start_kill() {
                            log::warn!("force kill of {name} failed: {e}");
                        }
                    }
                    // Handle dropped; keep waiting so the exit is still reaped.
                    None => break child.wait().await,
                },
            }
        };

        let info = match status {
            Ok(status) => ExitInfo {
                code: status.code(),
                signal: exit_signal(&status),
            },
            Err(e) => {
                log::error!("{name} wait failed: {e}");
                ExitInfo {
                    code: None,
                    signal: None,
                }
            }
        };
        log::info!("{name} exited with {info}");
        exit_tx.send_replace(Some(info));
    });

    Ok(ProcessHandle {
        name: spec.name.clone(),
        pid,
        exit_rx,
        kill_tx,
        io_tasks,
    })
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

async fn forward_lines<R>(
    name: String,
    stream: OutputStream,
    reader: R,
    output: broadcast::Sender<OutputLine>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        match stream {
            OutputStream::Stdout => log::info!("[{name}] {line}"),
            OutputStream::Stderr => log::error!("[{name}] {line}"),
        }
        // No subscribers is fine; lines are still logged.
        let _ = output.send(OutputLine {
            service: name.clone(),
            stream,
            line,
        });
    }
}

impl ProcessHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the child has already ended.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Resolve once the child has exited.
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(info) => (*info).unwrap_or(ExitInfo {
                code: None,
                signal: None,
            }),
            Err(_) => ExitInfo {
                code: None,
                signal: None,
            },
        }
    }

    /// Deliver `signal` once. Errors (process already gone) are logged only.
    pub fn kill(&self, signal: KillSignal) {
        if self.exit_info().is_some() {
            return;
        }
        match signal {
            KillSignal::Kill => {
                if self.kill_tx.try_send(()).is_err() {
                    log::debug!("{} kill request dropped (exiting)", self.name);
                }
            }
            KillSignal::Terminate | KillSignal::Interrupt => self.send_soft(signal),
        }
    }

    #[cfg(unix)]
    fn send_soft(&self, signal: KillSignal) {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let Some(raw) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        let sig = match signal {
            KillSignal::Interrupt => Signal::SIGINT,
            _ => Signal::SIGTERM,
        };
        match signal::kill(Pid::from_raw(raw), sig) {
            Ok(()) => log::info!("Sent {sig} to {} (PID: {raw})", self.name),
            Err(e) => log::warn!("Failed {sig} to {}: {e}", self.name),
        }
    }

    #[cfg(not(unix))]
    fn send_soft(&self, _signal: KillSignal) {
        // No soft termination for console-less children; escalate directly.
        let _ = self.kill_tx.try_send(());
    }

    /// Terminate gracefully, escalating to a forced kill after `grace`.
    ///
    /// Returns once the process has been reaped, so its port is free.
    pub async fn shutdown(&self, grace: Duration) -> Result<ExitInfo> {
        if let Some(info) = self.exit_info() {
            return Ok(info);
        }

        let started = tokio::time::Instant::now();
        self.kill(KillSignal::Terminate);

        if let Ok(info) = tokio::time::timeout(grace, self.wait()).await {
            log::info!(
                "{} exited gracefully in {:.2}s: {info}",
                self.name,
                started.elapsed().as_secs_f64()
            );
            return Ok(info);
        }

        log::warn!(
            "{} graceful shutdown timeout ({grace:?}), escalating to forced kill",
            self.name
        );
        self.kill(KillSignal::Kill);

        match tokio::time::timeout(Duration::from_secs(5), self.wait()).await {
            Ok(info) => {
                log::info!("{} terminated by forced kill: {info}", self.name);
                Ok(info)
            }
            Err(_) => Err(LlamadError::Io(std::io::Error::other(format!(
                "{} did not respond to forced kill after 5s (PID: {:?})",
                self.name, self.pid
            )))),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        for task in self.io_tasks.drain(..) {
            task.abort();
        }
    }
}
