//! Composition root: owns every component, routes UI commands to them and
//! tears them down in order.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelEvent, MessageChannel};
use crate::config::AppConfig;
use crate::download::{DownloadServerManager, DownloadStatus};
use crate::lookout::{HttpNotifier, LookoutSettings, ModelLookout, SupervisorSwapTarget};
use crate::process::{
    OutputStream, Phase, ProcessSupervisor, ServiceSpec, SupervisorEvent, SupervisorStatus,
};

/// Requests arriving from the UI.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum UiCommand {
    SendPrompt { text: String },
    StopPrompt { prompt_id: String },
    ClearMemory,
    RestartServer,
    Download { action: DownloadControl },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadControl {
    Start,
    Stop,
    Restart,
    Status,
}

/// Direct answer to a [`UiCommand`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reply", rename_all = "kebab-case")]
pub enum Reply {
    /// `prompt_id` is `None` when the channel was not connected.
    PromptSent { prompt_id: Option<String> },
    Done,
    Server { status: SupervisorStatus },
    Download { status: DownloadStatus },
}

/// Asynchronous events pushed to the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum UiEvent {
    Model(ChannelEvent),
    ServiceState { service: String, phase: Phase },
    /// A stderr line from the inference server.
    ServerError { service: String, message: String },
    /// A manual start failed. The service is left stopped.
    StartFailed { service: String, message: String },
    /// Restart budget exhausted; needs the user's attention.
    CriticalError { service: String, message: String },
}

type Lookout = ModelLookout<SupervisorSwapTarget, HttpNotifier>;

pub struct Orchestrator {
    config: AppConfig,
    inference: ProcessSupervisor,
    http: ProcessSupervisor,
    channel: MessageChannel,
    lookout: Lookout,
    download: OnceLock<Arc<DownloadServerManager>>,
    events: broadcast::Sender<UiEvent>,
    pumps: CancellationToken,
    pumps_started: Mutex<bool>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        let root = config.backend_root();
        log::info!("Backend root: {}", root.display());

        let inference = ProcessSupervisor::new(ServiceSpec::from_definition(
            &config.inference,
            &config.backend,
            &root,
        ));
        let http = ProcessSupervisor::new(ServiceSpec::from_definition(
            &config.http,
            &config.backend,
            &root,
        ));
        let channel = MessageChannel::new(
            config.channel.url.clone(),
            std::time::Duration::from_millis(config.channel.reconnect_delay_ms),
        );
        let lookout = ModelLookout::new(
            config.record_path(),
            LookoutSettings::from(&config.lookout),
            SupervisorSwapTarget::new(inference.clone(), config.http.health_url()),
            HttpNotifier::new(config.lookout.notify_url.clone()),
        );
        let (events, _) = broadcast::channel(1024);

        Self {
            config,
            inference,
            http,
            channel,
            lookout,
            download: OnceLock::new(),
            events,
            pumps: CancellationToken::new(),
            pumps_started: Mutex::new(false),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    #[must_use]
    pub fn inference(&self) -> &ProcessSupervisor {
        &self.inference
    }

    fn download_manager(&self) -> Arc<DownloadServerManager> {
        let fresh = self.download.get().is_none();
        let manager = DownloadServerManager::initialize(&self.download, &self.config);
        if fresh {
            self.spawn_supervisor_pump(manager.supervisor().clone(), false, false);
        }
        manager
    }

    /// Bring everything up: inference, channel, HTTP companion, lookout,
    /// download server.
    ///
    /// Only an inference failure is fatal; the rest degrade with a log line.
    pub async fn start(&self) -> Result<()> {
        self.spawn_pumps();

        if self.config.inference.enabled {
            if let Err(e) = self.inference.start().await {
                log::error!("Inference server failed to start: {e}");
                let _ = self.events.send(UiEvent::StartFailed {
                    service: self.inference.name().to_string(),
                    message: e.to_string(),
                });
                return Err(e).context("inference server failed to start");
            }
        }
        self.channel.connect();

        if self.config.http.enabled {
            if let Err(e) = self.http.start().await {
                log::error!("HTTP service unavailable, model swaps will fail: {e}");
            }
        }

        if let Err(e) = self.lookout.start().await {
            log::error!("Model lookout not started: {e}");
        }

        if self.config.download.enabled {
            if let Err(e) = self.download_manager().start().await {
                log::error!("Download server not started: {e}");
            }
        }

        log::info!("✓ All services started");
        Ok(())
    }

    /// Route one UI command.
    pub async fn handle(&self, command: UiCommand) -> Result<Reply> {
        match command {
            UiCommand::SendPrompt { text } => Ok(Reply::PromptSent {
                prompt_id: self.channel.send(&text),
            }),
            UiCommand::StopPrompt { prompt_id } => {
                self.channel.cancel(&prompt_id);
                Ok(Reply::Done)
            }
            UiCommand::ClearMemory => {
                self.channel.clear_memory();
                Ok(Reply::Done)
            }
            UiCommand::RestartServer => {
                let status = self
                    .inference
                    .restart()
                    .await
                    .context("inference restart failed")?;
                Ok(Reply::Server { status })
            }
            UiCommand::Download { action } => {
                let manager = self.download_manager();
                match action {
                    DownloadControl::Start => {
                        manager.start().await.context("download server start failed")?;
                    }
                    DownloadControl::Stop => {
                        manager.stop().await.context("download server stop failed")?;
                    }
                    DownloadControl::Restart => {
                        manager
                            .restart()
                            .await
                            .context("download server restart failed")?;
                    }
                    DownloadControl::Status => {}
                }
                Ok(Reply::Download {
                    status: manager.status().await,
                })
            }
        }
    }

    /// Ordered teardown: lookout, channel, download server, HTTP, inference.
    pub async fn shutdown(&self) {
        log::info!("Shutting down");
        self.lookout.stop().await;
        self.channel.shutdown();

        if let Some(manager) = self.download.get() {
            if let Err(e) = manager.stop().await {
                log::error!("Download server stop failed: {e}");
            }
        }
        if let Err(e) = self.http.stop().await {
            log::error!("HTTP service stop failed: {e}");
        }
        if let Err(e) = self.inference.stop().await {
            log::error!("Inference server stop failed: {e}");
        }

        self.pumps.cancel();
        log::info!("✓ Shutdown complete");
    }

    // ═══════════════════════════════════════════════════════════════
    // EVENT PUMPS: component events -> UiEvent
    // ═══════════════════════════════════════════════════════════════

    fn spawn_pumps(&self) {
        {
            let mut started = self
                .pumps_started
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *started {
                return;
            }
            *started = true;
        }

        self.spawn_supervisor_pump(self.inference.clone(), true, true);
        self.spawn_supervisor_pump(self.http.clone(), false, false);

        let mut rx = self.channel.subscribe();
        let events = self.events.clone();
        let cancel = self.pumps.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            let _ = events.send(UiEvent::Model(event));
                        }
                        Err(RecvError::Lagged(n)) => log::warn!("UI missed {n} channel events"),
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Forward a supervisor's events. For the inference server, stderr is
    /// surfaced and every return to `Running` re-arms the channel.
    fn spawn_supervisor_pump(
        &self,
        supervisor: ProcessSupervisor,
        forward_stderr: bool,
        reconnect_channel: bool,
    ) {
        let mut events = supervisor.subscribe();
        let mut output = supervisor.subscribe_output();
        let ui = self.events.clone();
        let cancel = self.pumps.clone();
        let channel = reconnect_channel.then(|| self.channel.clone());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(SupervisorEvent::Phase { service, phase }) => {
                            if phase == Phase::Running {
                                if let Some(channel) = &channel {
                                    channel.connect();
                                }
                            }
                            let _ = ui.send(UiEvent::ServiceState { service, phase });
                        }
                        Ok(SupervisorEvent::Restarted { service, automatic }) => {
                            log::info!("{service} restarted (automatic: {automatic})");
                            if let Some(channel) = &channel {
                                channel.connect();
                            }
                        }
                        Ok(SupervisorEvent::CriticalError { service, message }) => {
                            let _ = ui.send(UiEvent::CriticalError { service, message });
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("{} pump missed {n} events", supervisor.name());
                        }
                        Err(RecvError::Closed) => break,
                    },
                    line = output.recv(), if forward_stderr => match line {
                        Ok(line) if line.stream == OutputStream::Stderr => {
                            let _ = ui.send(UiEvent::ServerError {
                                service: line.service,
                                message: line.line,
                            });
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_decode_from_json_lines() {
        let cmd: UiCommand =
            serde_json::from_str(r#"{"command":"send-prompt","text":"hello"}"#).unwrap();
        assert_eq!(
            cmd,
            UiCommand::SendPrompt {
                text: "hello".into()
            }
        );
        let cmd: UiCommand =
            serde_json::from_str(r#"{"command":"download","action":"status"}"#).unwrap();
        assert_eq!(
            cmd,
            UiCommand::Download {
                action: DownloadControl::Status
            }
        );
        let cmd: UiCommand = serde_json::from_str(r#"{"command":"clear-memory"}"#).unwrap();
        assert_eq!(cmd, UiCommand::ClearMemory);
    }

    #[test]
    fn events_encode_with_type_tag() {
        let event = UiEvent::Model(ChannelEvent::Token {
            prompt_id: "p1".into(),
            token: "Hi".into(),
        });
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "model");
        assert_eq!(v["data"]["event"], "token");
        assert_eq!(v["data"]["token"], "Hi");

        let v = serde_json::to_value(UiEvent::CriticalError {
            service: "inference".into(),
            message: "gave up".into(),
        })
        .unwrap();
        assert_eq!(v["type"], "critical-error");
    }

    #[tokio::test]
    async fn prompt_without_connection_returns_no_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.backend.root_dir = Some(dir.path().display().to_string());
        let orchestrator = Orchestrator::new(cfg);

        let reply = orchestrator
            .handle(UiCommand::SendPrompt {
                text: "hello".into(),
            })
            .await
            .unwrap();
        assert!(matches!(reply, Reply::PromptSent { prompt_id: None }));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn missing_interpreter_fails_start_without_critical_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.backend.root_dir = Some(dir.path().display().to_string());
        let orchestrator = Orchestrator::new(cfg);
        let mut events = orchestrator.subscribe();

        assert!(orchestrator.start().await.is_err());

        let mut start_failed = false;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, UiEvent::CriticalError { .. }));
            start_failed |= matches!(event, UiEvent::StartFailed { .. });
        }
        assert!(start_failed);
        orchestrator.shutdown().await;
    }
}
