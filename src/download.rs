//! Lifecycle of the SSE model-download server.
//!
//! Only the server process is managed here; the download API itself is
//! consumed directly by the UI.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::Result;
use crate::probe;
use crate::process::{Phase, ProcessSupervisor, ServiceSpec};

/// Derived view of the download server, recomputed on every call.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadServerInfo {
    pub is_running: bool,
    pub phase: Phase,
    pub url: String,
    pub host: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
}

/// [`DownloadServerInfo`] plus a live health probe.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadStatus {
    #[serde(flatten)]
    pub info: DownloadServerInfo,
    pub healthy: bool,
    pub active_downloads: Option<u64>,
}

struct HealthLoop {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

pub struct DownloadServerManager {
    supervisor: ProcessSupervisor,
    url: String,
    health_url: String,
    health_interval: Duration,
    client: reqwest::Client,
    health: Mutex<Option<HealthLoop>>,
}

impl DownloadServerManager {
    /// Return the manager held in `slot`, constructing it on first use.
    ///
    /// Later calls ignore `cfg` and hand back the existing instance.
    pub fn initialize(slot: &OnceLock<Arc<Self>>, cfg: &AppConfig) -> Arc<Self> {
        slot.get_or_init(|| {
            log::info!("Initializing download server manager");
            Arc::new(Self::from_config(cfg))
        })
        .clone()
    }

    fn from_config(cfg: &AppConfig) -> Self {
        let root = cfg.backend_root();
        let spec = ServiceSpec::from_definition(&cfg.download, &cfg.backend, &root);
        let interval = Duration::from_secs(cfg.download.health_interval_secs.unwrap_or(30));
        Self::with_supervisor(ProcessSupervisor::new(spec), interval)
    }

    #[must_use]
    pub fn with_supervisor(supervisor: ProcessSupervisor, health_interval: Duration) -> Self {
        let spec = supervisor.spec();
        let url = format!("http://{}:{}", spec.host, spec.port);
        let health_url = format!("{url}/health");
        Self {
            supervisor,
            url,
            health_url,
            health_interval,
            client: probe::health_client(),
            health: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Start the server unless this manager already runs it.
    pub async fn start(&self) -> Result<DownloadServerInfo> {
        if matches!(
            self.supervisor.phase(),
            Phase::Running | Phase::Starting | Phase::Restarting
        ) {
            log::info!("Download server already running at {}", self.url);
            return Ok(self.info());
        }

        self.supervisor.start().await?;
        self.spawn_health_loop();
        log::info!("✓ Download server ready at {}", self.url);
        Ok(self.info())
    }

    pub async fn stop(&self) -> Result<()> {
        self.stop_health_loop();
        self.supervisor.stop().await
    }

    pub async fn restart(&self) -> Result<DownloadServerInfo> {
        self.stop_health_loop();
        self.supervisor.restart().await?;
        self.spawn_health_loop();
        Ok(self.info())
    }

    #[must_use]
    pub fn info(&self) -> DownloadServerInfo {
        let status = self.supervisor.status();
        let spec = self.supervisor.spec();
        DownloadServerInfo {
            is_running: status.phase == Phase::Running,
            phase: status.phase,
            url: self.url.clone(),
            host: spec.host.clone(),
            port: spec.port,
            pid: status.pid,
            uptime_secs: status.uptime_secs,
            restart_count: status.restart_count,
        }
    }

    /// `info()` plus what the server's `/health` reports right now.
    pub async fn status(&self) -> DownloadStatus {
        let body = probe::http_health(&self.client, &self.health_url).await;
        DownloadStatus {
            info: self.info(),
            healthy: body.as_ref().is_some_and(probe::body_is_healthy),
            active_downloads: body
                .as_ref()
                .and_then(|b| b.get("active_downloads"))
                .and_then(serde_json::Value::as_u64),
        }
    }

    fn spawn_health_loop(&self) {
        let mut slot = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let supervisor = self.supervisor.clone();
        let client = self.client.clone();
        let url = self.health_url.clone();
        let interval = self.health_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = token.cancelled() => break,
                }
                // restarts are exit-driven; this loop only reports
                if supervisor.phase() != Phase::Running {
                    continue;
                }
                match probe::http_health(&client, &url).await {
                    Some(body) if probe::body_is_healthy(&body) => {
                        log::debug!("Download server healthy: {body}");
                    }
                    Some(body) => log::warn!("Download server health degraded: {body}"),
                    None => log::warn!("Download server health check failed ({url})"),
                }
            }
        });

        *slot = Some(HealthLoop {
            cancel,
            _task: task,
        });
    }

    fn stop_health_loop(&self) {
        let taken = self
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(health) = taken {
            health.cancel.cancel();
        }
    }
}

impl Drop for DownloadServerManager {
    fn drop(&mut self) {
        self.stop_health_loop();
    }
}
