use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top‑level supervisor configuration (mirrors the desktop app's defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub backend: BackendConfig,
    /// WebSocket inference server (llama_server.py)
    pub inference: ServiceDefinition,
    /// HTTP companion (model switching, /model-ready)
    pub http: ServiceDefinition,
    /// SSE model-download server
    pub download: ServiceDefinition,
    pub channel: ChannelConfig,
    pub lookout: LookoutConfig,
}

fn default_true() -> bool {
    true
}

fn default_venv() -> String {
    "venv".to_string()
}

/// Where the Python backend lives and how to find its interpreter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend root; auto-discovered when unset
    pub root_dir: Option<String>,
    #[serde(default = "default_venv")]
    pub venv_dir: String,
    /// Fall back to `python3` on PATH when no venv interpreter exists
    #[serde(default)]
    pub allow_system_python: bool,
}

/// How a service script is turned into a command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LaunchMode {
    /// `python <script>` from the backend root
    #[default]
    Script,
    /// `python -m uvicorn <app> --host H --port P` from the script's directory
    Uvicorn {
        app: String,
        log_level: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ReadinessKind {
    #[default]
    Port,
    Http { path: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    /// `restart_delay * attempt`
    Linear,
}

/// What to do when the service port is already bound at start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortConflict {
    /// Treat the owner as a stale instance and terminate it
    #[default]
    KillForeign,
    /// Refuse to start
    Fail,
}

/// On‑disk description of a single supervised service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub description: Option<String>,
    /// Script path relative to the backend root
    pub script: String,
    #[serde(default)]
    pub launch: LaunchMode,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub readiness: ReadinessKind,
    pub readiness_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
    pub grace_period_ms: u64,
    pub restart_pause_ms: u64,
    #[serde(default)]
    pub on_port_conflict: PortConflict,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    /// Periodic health ping while running (download server only)
    pub health_interval_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ServiceDefinition {
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn health_url(&self) -> String {
        let path = match &self.readiness {
            ReadinessKind::Http { path } => path.as_str(),
            ReadinessKind::Port => "/health",
        };
        format!("{}/{}", self.base_url(), path.trim_start_matches('/'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub url: String,
    pub reconnect_delay_ms: u64,
}

/// Model-record watcher and hot-swap settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookoutConfig {
    /// Record path relative to the backend root (or absolute)
    pub record_path: String,
    pub debounce_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub http_ready_timeout_secs: u64,
    pub inference_ready_timeout_secs: u64,
    /// Base URL of the service receiving `POST /model-ready`
    pub notify_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut python_env = HashMap::new();
        python_env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        Self {
            backend: BackendConfig {
                root_dir: None,
                venv_dir: default_venv(),
                allow_system_python: false,
            },
            inference: ServiceDefinition {
                name: "inference".into(),
                description: Some("llama WebSocket inference server".into()),
                script: "python/Websocket/llama_server.py".into(),
                launch: LaunchMode::Script,
                host: "127.0.0.1".into(),
                port: 8765,
                readiness: ReadinessKind::Port,
                readiness_timeout_ms: 15_000,
                poll_interval_ms: 500,
                max_restarts: 3,
                restart_delay_ms: 3_000,
                backoff: BackoffKind::Fixed,
                grace_period_ms: 10_000,
                restart_pause_ms: 2_000,
                on_port_conflict: PortConflict::KillForeign,
                env_vars: python_env.clone(),
                health_interval_secs: None,
                enabled: true,
            },
            http: ServiceDefinition {
                name: "http".into(),
                description: Some("model switching HTTP API".into()),
                script: "python/HTTP/http_server.py".into(),
                launch: LaunchMode::Uvicorn {
                    app: "http_server:app".into(),
                    log_level: None,
                },
                host: "127.0.0.1".into(),
                port: 8001,
                readiness: ReadinessKind::Http {
                    path: "/health".into(),
                },
                readiness_timeout_ms: 15_000,
                poll_interval_ms: 500,
                max_restarts: 3,
                restart_delay_ms: 2_000,
                backoff: BackoffKind::Fixed,
                grace_period_ms: 10_000,
                restart_pause_ms: 1_000,
                on_port_conflict: PortConflict::KillForeign,
                env_vars: python_env.clone(),
                health_interval_secs: None,
                enabled: true,
            },
            download: ServiceDefinition {
                name: "download".into(),
                description: Some("SSE model download server".into()),
                script: "python/SSE/Download_SSE.py".into(),
                launch: LaunchMode::Uvicorn {
                    app: "Download_SSE:app".into(),
                    log_level: Some("warning".into()),
                },
                host: "127.0.0.1".into(),
                port: 8000,
                readiness: ReadinessKind::Http {
                    path: "/health".into(),
                },
                readiness_timeout_ms: 30_000,
                poll_interval_ms: 500,
                max_restarts: 3,
                restart_delay_ms: 5_000,
                backoff: BackoffKind::Linear,
                grace_period_ms: 10_000,
                restart_pause_ms: 1_000,
                on_port_conflict: PortConflict::Fail,
                env_vars: python_env,
                health_interval_secs: Some(30),
                enabled: true,
            },
            channel: ChannelConfig {
                url: "ws://127.0.0.1:8765".into(),
                reconnect_delay_ms: 3_000,
            },
            lookout: LookoutConfig {
                record_path: "config/current_model.json".into(),
                debounce_ms: 1_000,
                max_attempts: 3,
                retry_delay_ms: 2_000,
                http_ready_timeout_secs: 60,
                inference_ready_timeout_secs: 15,
                notify_url: "http://127.0.0.1:8001".into(),
            },
        }
    }
}

impl AppConfig {
    /// Resolved backend root directory.
    #[must_use]
    pub fn backend_root(&self) -> PathBuf {
        match &self.backend.root_dir {
            Some(dir) => PathBuf::from(dir),
            None => discover_backend_root(),
        }
    }

    /// Reject endpoints that can never work.
    pub fn validate(&self) -> Result<()> {
        let channel = url::Url::parse(&self.channel.url)
            .with_context(|| format!("invalid channel url {:?}", self.channel.url))?;
        if !matches!(channel.scheme(), "ws" | "wss") {
            anyhow::bail!("channel url must be ws:// or wss://, got {}", self.channel.url);
        }
        url::Url::parse(&self.lookout.notify_url)
            .with_context(|| format!("invalid notify url {:?}", self.lookout.notify_url))?;

        for service in [&self.inference, &self.http, &self.download] {
            if service.port == 0 {
                anyhow::bail!("{}: port must be non-zero", service.name);
            }
        }
        Ok(())
    }

    /// Absolute path of the watched model record.
    #[must_use]
    pub fn record_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.lookout.record_path);
        if path.is_absolute() {
            path
        } else {
            self.backend_root().join(path)
        }
    }
}

/// Default config location: `<config_dir>/llamad/llamad.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("llamad");
    Ok(config_dir.join("llamad.toml"))
}

/// Load the config at `path`, writing the defaults there first if it does
/// not exist yet.
pub fn load_or_create(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        log::info!(
            "Config not found at {}, creating default configuration",
            path.display()
        );

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let default_toml = toml::to_string_pretty(&AppConfig::default())
            .context("Failed to serialize default config")?;
        fs::write(path, default_toml).context("Failed to write config file")?;

        log::info!("Created default configuration at {}", path.display());
    }

    let cfg_str = fs::read_to_string(path).context("Failed to read config file")?;
    let cfg: AppConfig = toml::from_str(&cfg_str).context("Failed to parse config")?;
    log::info!("Using config from: {}", path.display());
    Ok(cfg)
}

/// Locate the Python backend directory.
///
/// Checks `LLAMAD_BACKEND`, then the packaged layout next to the executable,
/// then the working directory, then the per-user data directory.
pub fn discover_backend_root() -> PathBuf {
    if let Ok(dir) = std::env::var("LLAMAD_BACKEND")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }

    let mut search_paths = Vec::new();
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        search_paths.push(dir.join("backend"));
        search_paths.push(dir.join("..").join("backend"));
    }
    if let Ok(cwd) = std::env::current_dir() {
        search_paths.push(cwd.join("backend"));
    }
    if let Some(data) = dirs::data_local_dir() {
        search_paths.push(data.join("llamad").join("backend"));
    }

    for candidate in &search_paths {
        if candidate.is_dir() {
            log::debug!("Auto-discovered backend at {}", candidate.display());
            return candidate.clone();
        }
    }

    log::warn!("No backend directory found in standard locations, using ./backend");
    PathBuf::from("backend")
}

/// Ordered interpreter candidates inside the backend's virtual environment.
#[must_use]
pub fn interpreter_candidates(root: &Path, venv_dir: &str) -> Vec<PathBuf> {
    let venv = root.join(venv_dir);
    vec![
        venv.join("bin").join("python"),
        venv.join("bin").join("python3"),
        venv.join("Scripts").join("python.exe"),
        venv.join("Scripts").join("python3.exe"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.inference.port, 8765);
        assert_eq!(parsed.download.backoff, BackoffKind::Linear);
        assert_eq!(parsed.download.on_port_conflict, PortConflict::Fail);
        assert_eq!(
            parsed.http.launch,
            LaunchMode::Uvicorn {
                app: "http_server:app".into(),
                log_level: None
            }
        );
    }

    #[test]
    fn load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("llamad.toml");
        let cfg = load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.channel.reconnect_delay_ms, 3_000);
        assert_eq!(cfg.lookout.max_attempts, 3);
    }

    #[test]
    fn candidates_follow_venv_layout() {
        let c = interpreter_candidates(Path::new("/srv/backend"), "venv");
        assert_eq!(c[0], PathBuf::from("/srv/backend/venv/bin/python"));
        assert_eq!(c[3], PathBuf::from("/srv/backend/venv/Scripts/python3.exe"));
    }

    #[test]
    fn health_url_uses_readiness_path() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.download.health_url(), "http://127.0.0.1:8000/health");
        assert_eq!(cfg.inference.base_url(), "http://127.0.0.1:8765");
    }

    #[test]
    fn validation_rejects_non_websocket_channel() {
        assert!(AppConfig::default().validate().is_ok());
        let mut cfg = AppConfig::default();
        cfg.channel.url = "http://127.0.0.1:8765".into();
        assert!(cfg.validate().is_err());
        let mut cfg = AppConfig::default();
        cfg.download.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn absolute_record_path_is_kept() {
        let mut cfg = AppConfig::default();
        cfg.lookout.record_path = "/tmp/current_model.json".into();
        assert_eq!(cfg.record_path(), PathBuf::from("/tmp/current_model.json"));
    }
}
