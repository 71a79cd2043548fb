//! Per-service restart state machine.
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopped            (graceful exit / stop)
//!                           \-> Crashed -> Restarting -> Starting
//!                                      \-> FailedPermanently (budget spent)
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::launcher::{self, ExitInfo, KillSignal, LaunchSpec, OutputLine, ProcessHandle};
use crate::config::{
    self, BackendConfig, BackoffKind, LaunchMode, PortConflict, ReadinessKind, ServiceDefinition,
};
use crate::error::{LlamadError, Result};
use crate::probe;
use crate::readiness::{self, HttpCheck, PortCheck, Readiness, ReadinessCheck};

/// Delay before an automatic restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// `base * attempt`
    Linear(Duration),
}

impl BackoffPolicy {
    /// Delay before restart number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(d) => *d,
            Self::Linear(base) => base.saturating_mul(attempt.max(1)),
        }
    }

    fn base(&self) -> Duration {
        match self {
            Self::Fixed(d) | Self::Linear(d) => *d,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Crashed,
    Restarting,
    FailedPermanently,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Restarting => "restarting",
            Self::FailedPermanently => "failed permanently",
        };
        f.write_str(s)
    }
}

/// Resolved, launch-ready description of one service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    /// Probed in order; first existing file wins.
    pub interpreter_candidates: Vec<PathBuf>,
    /// Executable name looked up on PATH when no candidate exists.
    pub system_fallback: Option<String>,
    pub script: PathBuf,
    pub launch: LaunchMode,
    pub cwd: PathBuf,
    pub host: String,
    pub port: u16,
    pub env: BTreeMap<String, String>,
    pub readiness: ReadinessKind,
    pub readiness_timeout: Duration,
    pub poll_interval: Duration,
    pub max_restarts: u32,
    pub backoff: BackoffPolicy,
    pub grace_period: Duration,
    pub restart_pause: Duration,
    pub on_port_conflict: PortConflict,
}

impl ServiceSpec {
    /// Build from the on-disk definition, resolving paths against `root`.
    #[must_use]
    pub fn from_definition(def: &ServiceDefinition, backend: &BackendConfig, root: &Path) -> Self {
        let script = root.join(&def.script);
        let cwd = match def.launch {
            LaunchMode::Script => root.to_path_buf(),
            LaunchMode::Uvicorn { .. } => script
                .parent()
                .map_or_else(|| root.to_path_buf(), Path::to_path_buf),
        };
        let restart_delay = Duration::from_millis(def.restart_delay_ms);

        Self {
            name: def.name.clone(),
            interpreter_candidates: config::interpreter_candidates(root, &backend.venv_dir),
            system_fallback: backend.allow_system_python.then(|| "python3".to_string()),
            script,
            launch: def.launch.clone(),
            cwd,
            host: def.host.clone(),
            port: def.port,
            env: def.env_vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            readiness: def.readiness.clone(),
            readiness_timeout: Duration::from_millis(def.readiness_timeout_ms),
            poll_interval: Duration::from_millis(def.poll_interval_ms),
            max_restarts: def.max_restarts,
            backoff: match def.backoff {
                BackoffKind::Fixed => BackoffPolicy::Fixed(restart_delay),
                BackoffKind::Linear => BackoffPolicy::Linear(restart_delay),
            },
            grace_period: Duration::from_millis(def.grace_period_ms),
            restart_pause: Duration::from_millis(def.restart_pause_ms),
            on_port_conflict: def.on_port_conflict,
        }
    }

    /// Default readiness predicate for this service.
    #[must_use]
    pub fn readiness_check(&self) -> Arc<dyn ReadinessCheck> {
        match &self.readiness {
            ReadinessKind::Port => Arc::new(PortCheck::new(self.host.clone(), self.port)),
            ReadinessKind::Http { path } => Arc::new(HttpCheck::new(format!(
                "http://{}:{}/{}",
                self.host,
                self.port,
                path.trim_start_matches('/')
            ))),
        }
    }

    /// First existing interpreter, falling back to PATH when allowed.
    pub fn resolve_program(&self) -> Result<PathBuf> {
        if let Some(found) = self.interpreter_candidates.iter().find(|p| p.is_file()) {
            return Ok(found.clone());
        }

        if let Some(fallback) = &self.system_fallback {
            match which::which(fallback) {
                Ok(path) => {
                    log::warn!(
                        "{}: no virtual environment interpreter, using {}",
                        self.name,
                        path.display()
                    );
                    return Ok(path);
                }
                Err(e) => log::debug!("{fallback} not on PATH: {e}"),
            }
        }

        let tried = self
            .interpreter_candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(LlamadError::config(
            &self.name,
            format!("no interpreter found (tried: {tried})"),
        ))
    }

    fn launch_spec(&self, program: PathBuf) -> LaunchSpec {
        let args = match &self.launch {
            LaunchMode::Script => vec![self.script.display().to_string()],
            LaunchMode::Uvicorn { app, log_level } => {
                let mut args = vec![
                    "-m".to_string(),
                    "uvicorn".to_string(),
                    app.clone(),
                    "--host".to_string(),
                    self.host.clone(),
                    "--port".to_string(),
                    self.port.to_string(),
                ];
                if let Some(level) = log_level {
                    args.push("--log-level".to_string());
                    args.push(level.clone());
                }
                args
            }
        };

        LaunchSpec {
            name: self.name.clone(),
            program,
            args,
            cwd: Some(self.cwd.clone()),
            env: self.env.clone(),
        }
    }
}

/// Point-in-time view of a supervisor, safe to hand to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub service_name: String,
    pub phase: Phase,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub backoff_delay_ms: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub last_exit: Option<ExitInfo>,
    /// Total processes spawned by this supervisor.
    pub launches: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Phase {
        service: String,
        phase: Phase,
    },
    /// Back in `Running` after an automatic recovery or a manual `restart()`.
    Restarted {
        service: String,
        automatic: bool,
    },
    /// Restart budget exhausted. Sent once per failure episode.
    CriticalError {
        service: String,
        message: String,
    },
}

struct SupervisorState {
    phase: Phase,
    restart_count: u32,
    last_started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    last_exit: Option<ExitInfo>,
    launches: u64,
    process: Option<Arc<ProcessHandle>>,
    /// Bumped by every `start`/`stop`; work from an older generation is stale.
    generation: u64,
    cancel: CancellationToken,
}

struct Inner {
    spec: ServiceSpec,
    readiness: Arc<dyn ReadinessCheck>,
    state: Mutex<SupervisorState>,
    events: broadcast::Sender<SupervisorEvent>,
    output: broadcast::Sender<OutputLine>,
}

/// Owns at most one child for a named service and keeps it alive.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(spec: ServiceSpec) -> Self {
        let check = spec.readiness_check();
        Self::with_readiness(spec, check)
    }

    /// Like [`ProcessSupervisor::new`] with a custom readiness predicate.
    #[must_use]
    pub fn with_readiness(spec: ServiceSpec, readiness: Arc<dyn ReadinessCheck>) -> Self {
        let (events, _) = broadcast::channel(64);
        let (output, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                spec,
                readiness,
                state: Mutex::new(SupervisorState {
                    phase: Phase::Stopped,
                    restart_count: 0,
                    last_started_at: None,
                    started: None,
                    last_exit: None,
                    launches: 0,
                    process: None,
                    generation: 0,
                    cancel: CancellationToken::new(),
                }),
                events,
                output,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    #[must_use]
    pub fn spec(&self) -> &ServiceSpec {
        &self.inner.spec
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Output lines of whichever child is currently owned.
    #[must_use]
    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputLine> {
        self.inner.output.subscribe()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    #[must_use]
    pub fn status(&self) -> SupervisorStatus {
        let st = self.lock();
        self.snapshot(&st)
    }

    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, st: &SupervisorState) -> SupervisorStatus {
        let spec = &self.inner.spec;
        SupervisorStatus {
            service_name: spec.name.clone(),
            phase: st.phase,
            restart_count: st.restart_count,
            max_restarts: spec.max_restarts,
            backoff_delay_ms: u64::try_from(spec.backoff.base().as_millis()).unwrap_or(u64::MAX),
            last_started_at: st.last_started_at,
            pid: st.process.as_ref().and_then(|p| p.pid()),
            uptime_secs: match (st.phase, st.started) {
                (Phase::Running, Some(at)) => Some(at.elapsed().as_secs()),
                _ => None,
            },
            last_exit: st.last_exit,
            launches: st.launches,
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.inner.events.send(event);
    }

    fn emit_phase(&self, phase: Phase) {
        self.emit(SupervisorEvent::Phase {
            service: self.inner.spec.name.clone(),
            phase,
        });
    }

    /// Set `phase` if `generation` still owns the supervisor.
    fn transition(&self, generation: u64, phase: Phase) -> bool {
        {
            let mut st = self.lock();
            if st.generation != generation {
                return false;
            }
            st.phase = phase;
            if phase != Phase::Running {
                st.started = None;
            }
        }
        self.emit_phase(phase);
        true
    }

    /// Launch the service and wait until it is ready.
    ///
    /// No-op returning the current status when already `Starting`,
    /// `Restarting` or `Running`. A failure here is reported to the caller and
    /// never enters the automatic restart path.
    pub async fn start(&self) -> Result<SupervisorStatus> {
        self.start_from(None).await
    }

    /// `start()`, refused with `Cancelled` when `expected` no longer owns the
    /// supervisor.
    async fn start_from(&self, expected: Option<u64>) -> Result<SupervisorStatus> {
        let (generation, cancel) = {
            let mut st = self.lock();
            if expected.is_some_and(|g| g != st.generation) {
                return Err(LlamadError::Cancelled {
                    service: self.name().to_string(),
                });
            }
            if matches!(
                st.phase,
                Phase::Starting | Phase::Restarting | Phase::Running
            ) {
                log::debug!("{} already {}, start ignored", self.name(), st.phase);
                return Ok(self.snapshot(&st));
            }
            st.phase = Phase::Starting;
            st.restart_count = 0;
            st.generation += 1;
            st.cancel = CancellationToken::new();
            (st.generation, st.cancel.clone())
        };
        self.emit_phase(Phase::Starting);
        log::info!("Starting {}", self.name());

        match self.launch(generation, &cancel).await {
            Ok(()) => {
                log::info!("✓ {} is running", self.name());
                Ok(self.status())
            }
            Err(e) => {
                log::error!("{} failed to start: {e}", self.name());
                self.transition(generation, Phase::Stopped);
                Err(e)
            }
        }
    }

    /// Stop gracefully, force-killing after the grace period.
    ///
    /// Clears restart history. No-op when already stopped, apart from
    /// abandoning a `restart()` that is waiting out its pause.
    pub async fn stop(&self) -> Result<()> {
        self.stop_owned().await.map(|_| ())
    }

    /// Stop and hand back the generation and token a follow-up start must
    /// still hold to proceed. Any later `stop()` invalidates both.
    async fn stop_owned(&self) -> Result<(u64, CancellationToken)> {
        let (handle, owned) = {
            let mut st = self.lock();
            st.generation += 1;
            st.cancel.cancel();
            st.cancel = CancellationToken::new();
            let owned = (st.generation, st.cancel.clone());
            if st.phase == Phase::Stopped && st.process.is_none() {
                return Ok(owned);
            }
            (st.process.take(), owned)
        };
        log::info!("Stopping {}", self.name());

        let result = match &handle {
            Some(handle) => handle
                .shutdown(self.inner.spec.grace_period)
                .await
                .map(|info| {
                    self.lock().last_exit = Some(info);
                }),
            None => Ok(()),
        };

        {
            let mut st = self.lock();
            st.phase = Phase::Stopped;
            st.restart_count = 0;
            st.started = None;
        }
        self.emit_phase(Phase::Stopped);

        if let Err(e) = &result {
            log::error!("{} did not stop cleanly: {e}", self.name());
        } else {
            log::info!("✓ {} stopped", self.name());
        }
        result.map(|()| owned)
    }

    /// `stop()`, a short pause for the port to free up, then `start()`.
    ///
    /// Rejected with [`LlamadError::Busy`] while a start is in flight. A
    /// `stop()` issued during the pause wins and this returns `Cancelled`.
    pub async fn restart(&self) -> Result<SupervisorStatus> {
        let phase = self.phase();
        if matches!(phase, Phase::Starting | Phase::Restarting) {
            return Err(LlamadError::Busy {
                service: self.name().to_string(),
                phase: phase.to_string(),
            });
        }

        log::info!("Restarting {}", self.name());
        let (generation, cancel) = self.stop_owned().await?;
        tokio::select! {
            () = tokio::time::sleep(self.inner.spec.restart_pause) => {}
            () = cancel.cancelled() => {
                log::info!("{} restart abandoned, stopped during pause", self.name());
                return Err(LlamadError::Cancelled {
                    service: self.name().to_string(),
                });
            }
        }
        let status = self.start_from(Some(generation)).await?;
        self.emit(SupervisorEvent::Restarted {
            service: self.name().to_string(),
            automatic: false,
        });
        Ok(status)
    }

    // ═══════════════════════════════════════════════════════════════
    // LAUNCH: resolve, clear port, spawn, wait for readiness
    // ═══════════════════════════════════════════════════════════════

    async fn launch(&self, generation: u64, cancel: &CancellationToken) -> Result<()> {
        let spec = &self.inner.spec;
        let program = spec.resolve_program()?;
        if !spec.script.is_file() {
            return Err(LlamadError::config(
                &spec.name,
                format!("script not found at {}", spec.script.display()),
            ));
        }
        self.clear_port().await?;

        let handle = Arc::new(launcher::spawn(
            &spec.launch_spec(program),
            self.inner.output.clone(),
        )?);

        let superseded = {
            let mut st = self.lock();
            if st.generation == generation {
                st.process = Some(handle.clone());
                st.launches += 1;
                st.last_started_at = Some(Utc::now());
                st.started = Some(Instant::now());
                false
            } else {
                true
            }
        };
        if superseded {
            let _ = handle.shutdown(spec.grace_period).await;
            return Err(LlamadError::Cancelled {
                service: spec.name.clone(),
            });
        }

        let outcome = tokio::select! {
            outcome = readiness::wait_ready(
                self.inner.readiness.as_ref(),
                spec.poll_interval,
                spec.readiness_timeout,
                cancel,
            ) => outcome,
            info = handle.wait() => {
                self.release(generation, &handle, Some(info));
                return Err(LlamadError::RuntimeCrash {
                    service: spec.name.clone(),
                    detail: format!("exited during startup with {info}"),
                });
            }
        };

        match outcome {
            Readiness::Ready => {
                // Running and a fresh budget land together, before the exit
                // watcher can observe the child.
                {
                    let mut st = self.lock();
                    if st.generation != generation {
                        return Err(LlamadError::Cancelled {
                            service: spec.name.clone(),
                        });
                    }
                    st.phase = Phase::Running;
                    st.restart_count = 0;
                }
                self.emit_phase(Phase::Running);
                tokio::spawn(self.clone().watch_exit(handle, generation));
                Ok(())
            }
            Readiness::TimedOut => {
                log::warn!(
                    "{} not ready after {:?}, killing it",
                    spec.name,
                    spec.readiness_timeout
                );
                handle.kill(KillSignal::Kill);
                let info = tokio::time::timeout(Duration::from_secs(5), handle.wait())
                    .await
                    .ok();
                self.release(generation, &handle, info);
                Err(LlamadError::ReadinessTimeout {
                    service: spec.name.clone(),
                    timeout_ms: u64::try_from(spec.readiness_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                })
            }
            // stop() owns the teardown of this handle
            Readiness::Cancelled => Err(LlamadError::Cancelled {
                service: spec.name.clone(),
            }),
        }
    }

    fn release(&self, generation: u64, handle: &Arc<ProcessHandle>, info: Option<ExitInfo>) {
        let mut st = self.lock();
        if st.generation == generation
            && st.process.as_ref().is_some_and(|p| Arc::ptr_eq(p, handle))
        {
            st.process = None;
            st.started = None;
            if info.is_some() {
                st.last_exit = info;
            }
        }
    }

    async fn clear_port(&self) -> Result<()> {
        let spec = &self.inner.spec;
        if !probe::is_open(&spec.host, spec.port, Duration::from_millis(500)).await {
            return Ok(());
        }

        match spec.on_port_conflict {
            PortConflict::Fail => Err(LlamadError::config(
                &spec.name,
                format!("port {} is already in use by another process", spec.port),
            )),
            PortConflict::KillForeign => {
                log::warn!(
                    "{}: port {} held by a stale process, reclaiming it",
                    spec.name,
                    spec.port
                );
                probe::kill_port_owners(spec.port).await;
                if probe::is_open(&spec.host, spec.port, Duration::from_millis(500)).await {
                    log::warn!("{}: port {} still bound, continuing", spec.name, spec.port);
                }
                Ok(())
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // CRASH RECOVERY
    // ═══════════════════════════════════════════════════════════════

    /// Boxed so the spawn in `launch` does not need this future's concrete type.
    fn watch_exit(self, handle: Arc<ProcessHandle>, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let info = handle.wait().await;

            {
                let mut st = self.lock();
                if st.generation != generation || st.phase != Phase::Running {
                    return;
                }
                st.process = None;
                st.started = None;
                st.last_exit = Some(info);
            }

            if !info.is_crash() {
                log::info!("{} exited ({info}), not restarting", self.name());
                self.transition(generation, Phase::Stopped);
                return;
            }

            log::error!("{} crashed ({info})", self.name());
            self.transition(generation, Phase::Crashed);
            self.recover(
                generation,
                LlamadError::RuntimeCrash {
                    service: self.name().to_string(),
                    detail: info.to_string(),
                },
            )
            .await;
        })
    }

    async fn recover(&self, generation: u64, mut last_error: LlamadError) {
        let spec = &self.inner.spec;

        loop {
            let (attempt, cancel) = {
                let mut st = self.lock();
                if st.generation != generation {
                    return;
                }
                if st.restart_count >= spec.max_restarts {
                    break;
                }
                st.restart_count += 1;
                (st.restart_count, st.cancel.clone())
            };
            if !self.transition(generation, Phase::Restarting) {
                return;
            }

            let delay = spec.backoff.delay(attempt);
            log::warn!(
                "{} restarting in {delay:?} (attempt {attempt}/{})",
                spec.name,
                spec.max_restarts
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return,
            }

            if !self.transition(generation, Phase::Starting) {
                return;
            }
            match self.launch(generation, &cancel).await {
                Ok(()) => {
                    if self.lock().generation == generation {
                        log::info!("✓ {} recovered on attempt {attempt}", spec.name);
                        self.emit(SupervisorEvent::Restarted {
                            service: spec.name.clone(),
                            automatic: true,
                        });
                    }
                    return;
                }
                Err(LlamadError::Cancelled { .. }) => return,
                Err(e) if e.counts_as_crash() => {
                    log::error!("{} restart attempt {attempt} failed: {e}", spec.name);
                    last_error = e;
                    if !self.transition(generation, Phase::Crashed) {
                        return;
                    }
                }
                Err(e) => {
                    last_error = e;
                    break;
                }
            }
        }

        if !self.transition(generation, Phase::FailedPermanently) {
            return;
        }
        let message = format!(
            "{} failed permanently after {} restart attempts: {last_error}",
            spec.name,
            self.lock().restart_count
        );
        log::error!("{message}");
        self.emit(SupervisorEvent::CriticalError {
            service: spec.name.clone(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delays() {
        let fixed = BackoffPolicy::Fixed(Duration::from_secs(3));
        assert_eq!(fixed.delay(1), Duration::from_secs(3));
        assert_eq!(fixed.delay(3), Duration::from_secs(3));

        let linear = BackoffPolicy::Linear(Duration::from_secs(5));
        assert_eq!(linear.delay(1), Duration::from_secs(5));
        assert_eq!(linear.delay(3), Duration::from_secs(15));
    }

    #[test]
    fn uvicorn_command_line() {
        let cfg = crate::config::AppConfig::default();
        let spec = ServiceSpec::from_definition(&cfg.download, &cfg.backend, Path::new("/srv/b"));
        let launch = spec.launch_spec(PathBuf::from("/srv/b/venv/bin/python"));
        assert_eq!(
            launch.args,
            [
                "-m",
                "uvicorn",
                "Download_SSE:app",
                "--host",
                "127.0.0.1",
                "--port",
                "8000",
                "--log-level",
                "warning"
            ]
        );
        assert_eq!(launch.cwd, Some(PathBuf::from("/srv/b/python/SSE")));
        assert_eq!(spec.backoff, BackoffPolicy::Linear(Duration::from_secs(5)));
    }

    #[test]
    fn script_command_line_runs_from_root() {
        let cfg = crate::config::AppConfig::default();
        let spec = ServiceSpec::from_definition(&cfg.inference, &cfg.backend, Path::new("/srv/b"));
        let launch = spec.launch_spec(PathBuf::from("python"));
        assert_eq!(launch.args, ["/srv/b/python/Websocket/llama_server.py"]);
        assert_eq!(launch.cwd, Some(PathBuf::from("/srv/b")));
    }

    #[test]
    fn missing_interpreter_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = crate::config::AppConfig::default();
        let spec = ServiceSpec::from_definition(&cfg.inference, &cfg.backend, dir.path());
        let err = spec.resolve_program().unwrap_err();
        assert!(matches!(err, LlamadError::Configuration { .. }));
        assert!(!err.counts_as_crash());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::readiness::FnCheck;

        fn free_port() -> u16 {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        }

        fn sh_spec(dir: &Path, body: &str) -> ServiceSpec {
            let script = dir.join("service.sh");
            std::fs::write(&script, body).unwrap();
            ServiceSpec {
                name: "svc".to_string(),
                interpreter_candidates: vec![PathBuf::from("/bin/sh")],
                system_fallback: None,
                script,
                launch: LaunchMode::Script,
                cwd: dir.to_path_buf(),
                host: "127.0.0.1".to_string(),
                port: free_port(),
                env: BTreeMap::new(),
                readiness: ReadinessKind::Port,
                readiness_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(20),
                max_restarts: 3,
                backoff: BackoffPolicy::Fixed(Duration::from_millis(50)),
                grace_period: Duration::from_secs(2),
                restart_pause: Duration::from_millis(50),
                on_port_conflict: PortConflict::KillForeign,
            }
        }

        /// Ready while `flag` exists.
        fn while_present(flag: PathBuf) -> Arc<dyn ReadinessCheck> {
            Arc::new(FnCheck::new("flag", move || {
                let present = flag.exists();
                let fut: BoxFuture<'static, bool> = Box::pin(async move { present });
                fut
            }))
        }

        /// Up once, then every relaunch dies before it becomes ready.
        const UP_ONCE_THEN_BROKEN: &str = "n=$(cat count 2>/dev/null || echo 0)\n\
            n=$((n+1))\n\
            echo $n > count\n\
            if [ $n -eq 1 ]; then touch ready; sleep 0.2; rm -f ready; fi\n\
            exit 1\n";

        fn always(ready: bool) -> Arc<dyn ReadinessCheck> {
            Arc::new(FnCheck::new("fixed", move || {
                let fut: BoxFuture<'static, bool> = Box::pin(async move { ready });
                fut
            }))
        }

        async fn wait_for(sup: &ProcessSupervisor, pred: impl Fn(&SupervisorStatus) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                let status = sup.status();
                if pred(&status) {
                    return;
                }
                assert!(Instant::now() < deadline, "timed out, last status {status:?}");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        #[tokio::test]
        async fn start_then_stop() {
            let dir = tempfile::tempdir().unwrap();
            let sup =
                ProcessSupervisor::with_readiness(sh_spec(dir.path(), "exec sleep 30"), always(true));

            let status = sup.start().await.unwrap();
            assert_eq!(status.phase, Phase::Running);
            assert!(status.pid.is_some());
            assert_eq!(status.launches, 1);

            sup.stop().await.unwrap();
            let status = sup.status();
            assert_eq!(status.phase, Phase::Stopped);
            assert_eq!(status.pid, None);

            // second stop is a no-op
            sup.stop().await.unwrap();
        }

        #[tokio::test]
        async fn concurrent_start_spawns_once() {
            let dir = tempfile::tempdir().unwrap();
            let slow: Arc<dyn ReadinessCheck> = Arc::new(FnCheck::new("slow", || {
                let fut: BoxFuture<'static, bool> = Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    true
                });
                fut
            }));
            let sup = ProcessSupervisor::with_readiness(sh_spec(dir.path(), "exec sleep 30"), slow);

            let (a, b) = tokio::join!(sup.start(), sup.start());
            a.unwrap();
            b.unwrap();
            wait_for(&sup, |s| s.phase == Phase::Running).await;
            assert_eq!(sup.status().launches, 1);
            sup.stop().await.unwrap();
        }

        #[tokio::test]
        async fn crash_within_budget_recovers() {
            let dir = tempfile::tempdir().unwrap();
            let body = "n=$(cat count 2>/dev/null || echo 0)\n\
                        n=$((n+1))\n\
                        echo $n > count\n\
                        if [ $n -le 2 ]; then sleep 0.2; exit 1; fi\n\
                        exec sleep 30\n";
            let sup = ProcessSupervisor::with_readiness(sh_spec(dir.path(), body), always(true));
            let mut events = sup.subscribe();

            sup.start().await.unwrap();
            wait_for(&sup, |s| s.launches == 3 && s.phase == Phase::Running).await;
            assert_eq!(sup.status().restart_count, 0);

            let mut automatic_restarts = 0;
            while let Ok(event) = events.try_recv() {
                match event {
                    SupervisorEvent::Restarted { automatic: true, .. } => automatic_restarts += 1,
                    SupervisorEvent::CriticalError { .. } => panic!("unexpected critical error"),
                    _ => {}
                }
            }
            assert_eq!(automatic_restarts, 2);

            sup.stop().await.unwrap();
            assert_eq!(sup.status().restart_count, 0);
        }

        #[tokio::test]
        async fn exhausted_budget_fails_permanently_once() {
            let dir = tempfile::tempdir().unwrap();
            let mut spec = sh_spec(dir.path(), UP_ONCE_THEN_BROKEN);
            spec.max_restarts = 2;
            let sup = ProcessSupervisor::with_readiness(spec, while_present(dir.path().join("ready")));
            let mut events = sup.subscribe();

            sup.start().await.unwrap();
            wait_for(&sup, |s| s.phase == Phase::FailedPermanently).await;
            tokio::time::sleep(Duration::from_millis(300)).await;

            let status = sup.status();
            assert_eq!(status.phase, Phase::FailedPermanently);
            assert_eq!(status.restart_count, 2);
            assert_eq!(status.launches, 3);
            assert_eq!(status.last_exit.and_then(|e| e.code), Some(1));

            let mut critical = 0;
            while let Ok(event) = events.try_recv() {
                if matches!(event, SupervisorEvent::CriticalError { .. }) {
                    critical += 1;
                }
            }
            assert_eq!(critical, 1);

            // manual stop clears the terminal state
            sup.stop().await.unwrap();
            assert_eq!(sup.phase(), Phase::Stopped);
        }

        #[tokio::test]
        async fn budget_resets_after_each_recovery() {
            let dir = tempfile::tempdir().unwrap();
            // five crashes after becoming ready, more than the budget of 3
            let body = "n=$(cat count 2>/dev/null || echo 0)\n\
                        n=$((n+1))\n\
                        echo $n > count\n\
                        if [ $n -le 5 ]; then sleep 0.3; exit 1; fi\n\
                        exec sleep 30\n";
            let sup = ProcessSupervisor::with_readiness(sh_spec(dir.path(), body), always(true));
            let mut events = sup.subscribe();

            sup.start().await.unwrap();
            wait_for(&sup, |s| s.launches == 6 && s.phase == Phase::Running).await;
            tokio::time::sleep(Duration::from_millis(200)).await;

            let status = sup.status();
            assert_eq!(status.phase, Phase::Running);
            assert_eq!(status.restart_count, 0);
            while let Ok(event) = events.try_recv() {
                assert!(!matches!(event, SupervisorEvent::CriticalError { .. }));
            }
            sup.stop().await.unwrap();
        }

        #[tokio::test]
        async fn stop_during_restart_pause_wins() {
            let dir = tempfile::tempdir().unwrap();
            let mut spec = sh_spec(dir.path(), "exec sleep 30");
            spec.restart_pause = Duration::from_millis(500);
            let sup = ProcessSupervisor::with_readiness(spec, always(true));
            sup.start().await.unwrap();

            let restarter = sup.clone();
            let task = tokio::spawn(async move { restarter.restart().await });
            tokio::time::sleep(Duration::from_millis(200)).await;
            sup.stop().await.unwrap();

            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, LlamadError::Cancelled { .. }));
            tokio::time::sleep(Duration::from_millis(500)).await;
            let status = sup.status();
            assert_eq!(status.phase, Phase::Stopped);
            assert_eq!(status.pid, None);
            assert_eq!(status.launches, 1);
        }

        #[tokio::test]
        async fn clean_exit_does_not_restart() {
            let dir = tempfile::tempdir().unwrap();
            let sup =
                ProcessSupervisor::with_readiness(sh_spec(dir.path(), "sleep 0.1; exit 0"), always(true));
            sup.start().await.unwrap();
            wait_for(&sup, |s| s.phase == Phase::Stopped).await;
            assert_eq!(sup.status().launches, 1);
        }

        #[tokio::test]
        async fn readiness_timeout_kills_child() {
            let dir = tempfile::tempdir().unwrap();
            let mut spec = sh_spec(dir.path(), "exec sleep 30");
            spec.readiness_timeout = Duration::from_millis(200);
            let sup = ProcessSupervisor::with_readiness(spec, always(false));

            let err = sup.start().await.unwrap_err();
            assert!(matches!(err, LlamadError::ReadinessTimeout { .. }));
            let status = sup.status();
            assert_eq!(status.phase, Phase::Stopped);
            assert_eq!(status.pid, None);
            assert_eq!(status.restart_count, 0);
        }

        #[tokio::test]
        async fn stop_cancels_pending_readiness() {
            let dir = tempfile::tempdir().unwrap();
            let mut spec = sh_spec(dir.path(), "exec sleep 30");
            spec.readiness_timeout = Duration::from_secs(30);
            let sup = ProcessSupervisor::with_readiness(spec, always(false));

            let starter = sup.clone();
            let started = Instant::now();
            let task = tokio::spawn(async move { starter.start().await });
            tokio::time::sleep(Duration::from_millis(200)).await;

            let err = sup.restart().await.unwrap_err();
            assert!(matches!(err, LlamadError::Busy { .. }));

            sup.stop().await.unwrap();
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, LlamadError::Cancelled { .. }));
            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(sup.phase(), Phase::Stopped);
        }

        #[tokio::test]
        async fn missing_script_is_reported() {
            let dir = tempfile::tempdir().unwrap();
            let mut spec = sh_spec(dir.path(), "exit 0");
            spec.script = dir.path().join("nope.sh");
            let sup = ProcessSupervisor::with_readiness(spec, always(true));
            let err = sup.start().await.unwrap_err();
            assert!(matches!(err, LlamadError::Configuration { .. }));
            assert_eq!(sup.phase(), Phase::Stopped);
        }

        #[tokio::test]
        async fn foreign_port_owner_fails_when_policy_is_fail() {
            let dir = tempfile::tempdir().unwrap();
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let mut spec = sh_spec(dir.path(), "exec sleep 30");
            spec.port = listener.local_addr().unwrap().port();
            spec.on_port_conflict = PortConflict::Fail;
            let sup = ProcessSupervisor::with_readiness(spec, always(true));

            let err = sup.start().await.unwrap_err();
            assert!(matches!(err, LlamadError::Configuration { .. }));
            assert_eq!(sup.status().launches, 0);
        }

        #[tokio::test]
        async fn manual_restart_emits_restarted() {
            let dir = tempfile::tempdir().unwrap();
            let sup =
                ProcessSupervisor::with_readiness(sh_spec(dir.path(), "exec sleep 30"), always(true));
            let mut events = sup.subscribe();
            let first = sup.start().await.unwrap().pid;

            let status = sup.restart().await.unwrap();
            assert_eq!(status.phase, Phase::Running);
            assert_ne!(status.pid, first);
            assert_eq!(status.launches, 2);

            let mut seen = false;
            while let Ok(event) = events.try_recv() {
                seen |= matches!(event, SupervisorEvent::Restarted { automatic: false, .. });
            }
            assert!(seen);
            sup.stop().await.unwrap();
        }
    }
}
