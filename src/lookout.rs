//! Watches the "current model" record and hot-swaps the inference server
//! when the selected model changes.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LookoutConfig;
use crate::error::{LlamadError, Result};
use crate::process::ProcessSupervisor;
use crate::readiness::{self, HttpCheck, PortCheck, Readiness};

/// The persisted record, written by the model-selection flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfigRecord {
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Read the record; `None` when missing, empty or malformed.
pub async fn read_record(path: &Path) -> Option<ModelConfigRecord> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Model record {} unreadable: {e}", path.display());
            return None;
        }
    };
    if text.trim().is_empty() {
        log::warn!("Model record {} is empty", path.display());
        return None;
    }
    match serde_json::from_str(&text) {
        Ok(record) => Some(record),
        Err(e) => {
            log::warn!("Model record {} malformed: {e}", path.display());
            None
        }
    }
}

/// Body of `POST /model-ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadyReport {
    pub operation_id: String,
    pub success: bool,
    pub message: String,
}

/// What a swap drives.
pub trait SwapTarget: Send + Sync + 'static {
    fn restart_inference(&self) -> impl Future<Output = Result<()>> + Send;

    /// HTTP companion healthy within `timeout`. Required for success.
    fn wait_http_ready(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> impl Future<Output = bool> + Send;

    /// Inference port open within `timeout`. Advisory only.
    fn wait_inference_ready(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> impl Future<Output = bool> + Send;
}

/// Receives the swap verdict for an operation id.
pub trait ReadyNotifier: Send + Sync + 'static {
    fn notify(&self, report: &ReadyReport) -> impl Future<Output = Result<()>> + Send;
}

/// Swap target backed by the real supervisors.
pub struct SupervisorSwapTarget {
    inference: ProcessSupervisor,
    http_health_url: String,
    poll_interval: Duration,
}

impl SupervisorSwapTarget {
    #[must_use]
    pub fn new(inference: ProcessSupervisor, http_health_url: impl Into<String>) -> Self {
        Self {
            inference,
            http_health_url: http_health_url.into(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl SwapTarget for SupervisorSwapTarget {
    async fn restart_inference(&self) -> Result<()> {
        self.inference.restart().await.map(|_| ())
    }

    async fn wait_http_ready(&self, timeout: Duration, cancel: &CancellationToken) -> bool {
        let check = HttpCheck::new(self.http_health_url.clone());
        readiness::wait_ready(&check, self.poll_interval, timeout, cancel).await
            == Readiness::Ready
    }

    async fn wait_inference_ready(&self, timeout: Duration, cancel: &CancellationToken) -> bool {
        let spec = self.inference.spec();
        let check = PortCheck::new(spec.host.clone(), spec.port);
        readiness::wait_ready(&check, self.poll_interval, timeout, cancel).await
            == Readiness::Ready
    }
}

/// Posts reports to `<base_url>/model-ready`.
pub struct HttpNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNotifier {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

impl ReadyNotifier for HttpNotifier {
    async fn notify(&self, report: &ReadyReport) -> Result<()> {
        let url = format!("{}/model-ready", self.base_url.trim_end_matches('/'));
        self.client
            .post(&url)
            .json(report)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| LlamadError::Channel(format!("POST {url}: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LookoutSettings {
    pub debounce: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub http_ready_timeout: Duration,
    pub inference_ready_timeout: Duration,
}

impl From<&LookoutConfig> for LookoutSettings {
    fn from(cfg: &LookoutConfig) -> Self {
        Self {
            debounce: Duration::from_millis(cfg.debounce_ms),
            max_attempts: cfg.max_attempts.max(1),
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
            http_ready_timeout: Duration::from_secs(cfg.http_ready_timeout_secs),
            inference_ready_timeout: Duration::from_secs(cfg.inference_ready_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    /// Record unreadable/empty, or a swap was already in progress.
    Skipped,
    Unchanged,
    Swapped { model: String, attempts: u32 },
    Failed { model: String, message: String },
}

struct Running {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

struct LookoutInner<S, N> {
    record_path: PathBuf,
    settings: LookoutSettings,
    target: S,
    notifier: N,
    last_model: Mutex<Option<String>>,
    processing: AtomicBool,
    cancel: Mutex<CancellationToken>,
    running: Mutex<Option<Running>>,
}

/// Resets the processing flag however the swap ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ModelLookout<S, N> {
    inner: Arc<LookoutInner<S, N>>,
}

impl<S, N> Clone for ModelLookout<S, N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: SwapTarget, N: ReadyNotifier> ModelLookout<S, N> {
    pub fn new(record_path: PathBuf, settings: LookoutSettings, target: S, notifier: N) -> Self {
        Self {
            inner: Arc::new(LookoutInner {
                record_path,
                settings,
                target,
                notifier,
                last_model: Mutex::new(None),
                processing: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                running: Mutex::new(None),
            }),
        }
    }

    /// Last model known to be loaded.
    #[must_use]
    pub fn last_model(&self) -> Option<String> {
        locked(&self.inner.last_model).clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        locked(&self.inner.running).is_some()
    }

    /// Seed the baseline from the current record and start watching it.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            log::info!("Model lookout is already running");
            return Ok(());
        }

        let path = &self.inner.record_path;
        if let Some(record) = read_record(path).await {
            log::info!(
                "Current model: {}",
                record.model_name.as_deref().unwrap_or("none")
            );
            *locked(&self.inner.last_model) = record.model_name;
        }

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let file_name = path.file_name().map(ToOwned::to_owned);
        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if matches!(event.kind, EventKind::Access(_)) {
                            return;
                        }
                        if event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == file_name.as_deref())
                        {
                            let _ = tx.send(());
                        }
                    }
                    Err(e) => log::warn!("Model record watcher error: {e}"),
                }
            })
            .map_err(|e| LlamadError::Io(std::io::Error::other(e)))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| LlamadError::Io(std::io::Error::other(e)))?;

        let mut running = locked(&self.inner.running);
        if running.is_some() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        *locked(&self.inner.cancel) = cancel.clone();
        let task = tokio::spawn(self.clone().debounce_loop(rx, cancel));
        *running = Some(Running {
            _watcher: watcher,
            task,
        });
        log::info!("Model lookout watching {}", path.display());
        Ok(())
    }

    /// Stop watching and wait for the debounce task to finish. A swap in
    /// progress is abandoned; once this returns nothing more is restarted.
    pub async fn stop(&self) {
        let Some(running) = locked(&self.inner.running).take() else {
            return;
        };
        locked(&self.inner.cancel).cancel();
        if let Err(e) = running.task.await {
            log::warn!("Model lookout task ended abnormally: {e}");
        }
        log::info!("Model lookout stopped");
    }

    async fn debounce_loop(self, mut rx: mpsc::UnboundedReceiver<()>, cancel: CancellationToken) {
        let debounce = self.inner.settings.debounce;
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                change = rx.recv() => match change {
                    Some(()) => deadline = Some(Instant::now() + debounce),
                    None => break,
                },
                () = until(deadline) => {
                    deadline = None;
                    tokio::select! {
                        outcome = self.handle_change() => {
                            log::debug!("model record change handled: {outcome:?}");
                        }
                        () = cancel.cancelled() => break,
                    }
                }
            }
        }
    }

    /// Read the record and swap if the model changed.
    pub async fn handle_change(&self) -> SwapOutcome {
        if self.inner.processing.swap(true, Ordering::SeqCst) {
            log::info!("Swap already in progress, skipping");
            return SwapOutcome::Skipped;
        }
        let _guard = ProcessingGuard(&self.inner.processing);

        let Some(record) = read_record(&self.inner.record_path).await else {
            return SwapOutcome::Skipped;
        };
        let Some(model) = record.model_name.filter(|m| !m.is_empty()) else {
            log::warn!("Model record has no model_name, skipping");
            return SwapOutcome::Skipped;
        };

        let previous = self.last_model();
        if previous.as_deref() == Some(model.as_str()) {
            log::info!("No actual change detected, skipping restart");
            return SwapOutcome::Unchanged;
        }
        log::info!(
            "Model changed: {} -> {model}",
            previous.as_deref().unwrap_or("none")
        );

        let settings = &self.inner.settings;
        let cancel = locked(&self.inner.cancel).clone();
        let mut last_error = String::new();

        for attempt in 1..=settings.max_attempts {
            if cancel.is_cancelled() {
                log::warn!("Swap to {model} abandoned, lookout stopping");
                return SwapOutcome::Skipped;
            }

            match self.try_swap(&cancel).await {
                Ok(()) => {
                    *locked(&self.inner.last_model) = Some(model.clone());
                    log::info!("✓ Model update to {model} completed (attempt {attempt})");
                    self.report(record.operation_id.as_deref(), true, "Server restarted")
                        .await;
                    return SwapOutcome::Swapped { model, attempts: attempt };
                }
                Err(message) => {
                    log::warn!(
                        "Swap attempt {attempt}/{} failed: {message}",
                        settings.max_attempts
                    );
                    last_error = message;
                }
            }

            if attempt < settings.max_attempts {
                tokio::select! {
                    () = tokio::time::sleep(settings.retry_delay) => {}
                    () = cancel.cancelled() => {}
                }
            }
        }

        if cancel.is_cancelled() {
            log::warn!("Swap to {model} abandoned, lookout stopping");
            return SwapOutcome::Skipped;
        }

        let err = LlamadError::SwapFailure {
            attempts: settings.max_attempts,
            message: last_error,
        };
        log::error!("{err}");
        let message = err.to_string();
        self.report(record.operation_id.as_deref(), false, &message)
            .await;
        SwapOutcome::Failed { model, message }
    }

    async fn try_swap(&self, cancel: &CancellationToken) -> std::result::Result<(), String> {
        let settings = &self.inner.settings;
        let target = &self.inner.target;

        target
            .restart_inference()
            .await
            .map_err(|e| format!("restart failed: {e}"))?;

        if !target
            .wait_http_ready(settings.http_ready_timeout, cancel)
            .await
        {
            return Err(format!(
                "HTTP service not healthy within {:?}",
                settings.http_ready_timeout
            ));
        }

        if !target
            .wait_inference_ready(settings.inference_ready_timeout, cancel)
            .await
        {
            log::warn!("Inference port not open yet, model may still be loading");
        }
        Ok(())
    }

    async fn report(&self, operation_id: Option<&str>, success: bool, message: &str) {
        let Some(operation_id) = operation_id else {
            log::info!("No operation_id, skipping notification");
            return;
        };
        let report = ReadyReport {
            operation_id: operation_id.to_string(),
            success,
            message: message.to_string(),
        };
        match self.inner.notifier.notify(&report).await {
            Ok(()) => log::info!(
                "HTTP server notified: {}",
                if success { "SUCCESS" } else { "FAILED" }
            ),
            Err(e) => log::error!("Error notifying HTTP server: {e}"),
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
