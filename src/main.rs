mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use llamad::channel::{ChannelEvent, MessageChannel};
use llamad::config::{self, AppConfig};
use llamad::orchestrator::{Orchestrator, UiCommand};
use llamad::probe;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

fn main() {
    // Initialize logger with custom format for daemon
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(real_main()) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn real_main() -> Result<()> {
    let args = cli::Args::parse();

    let cfg_path = match args.config {
        Some(path) => PathBuf::from(path),
        None => config::default_config_path()?,
    };
    let cfg = config::load_or_create(&cfg_path)?;
    cfg.validate().context("invalid configuration")?;

    match args.sub.unwrap_or(cli::Cmd::Run) {
        cli::Cmd::Run => run(cfg).await,
        cli::Cmd::Status => handle_status(&cfg).await,
        cli::Cmd::Prompt {
            text,
            connect_timeout,
        } => handle_prompt(&cfg, &text, Duration::from_secs(connect_timeout)).await,
    }
}

/// Full supervision. JSON-lines commands on stdin, JSON-lines events and
/// replies on stdout, until SIGINT / SIGTERM.
async fn run(cfg: AppConfig) -> Result<()> {
    install_signal_handlers()?;

    let orchestrator = Arc::new(Orchestrator::new(cfg));
    let (out_tx, out_rx) = mpsc::unbounded_channel::<serde_json::Value>();
    let writer = tokio::spawn(write_json_lines(out_rx));

    let mut events = orchestrator.subscribe();
    let event_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_value(&event) {
                    Ok(value) => {
                        if event_tx.send(value).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("unserializable UI event: {e}"),
                },
                Err(RecvError::Lagged(n)) => warn!("stdout fell behind, {n} events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = orchestrator.start().await {
        orchestrator.shutdown().await;
        return Err(e);
    }
    info!("llamad started (pid {})", std::process::id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut sig_tick = tokio::time::interval(Duration::from_millis(200));

    loop {
        tokio::select! {
            _ = sig_tick.tick() => {
                if let Some(sig) = check_signals() { // coarse polling ≈200 ms
                    info!("signal {sig} – orderly shutdown");
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => dispatch_line(&orchestrator, &line, &out_tx),
                Ok(None) => {
                    info!("stdin closed, running until signalled");
                    stdin_open = false;
                }
                Err(e) => {
                    error!("stdin read failed: {e}");
                    stdin_open = false;
                }
            }
        }
    }

    orchestrator.shutdown().await;
    forwarder.abort();
    drop(out_tx);
    let _ = writer.await;
    info!("llamad exiting");
    Ok(())
}

/// Decode one command line and run it in the background so a slow restart
/// never stalls signal polling.
fn dispatch_line(
    orchestrator: &Arc<Orchestrator>,
    line: &str,
    out: &mpsc::UnboundedSender<serde_json::Value>,
) {
    let command: UiCommand = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => {
            warn!("bad command {line:?}: {e}");
            let _ = out.send(serde_json::json!({"reply": "error", "message": e.to_string()}));
            return;
        }
    };

    let orchestrator = orchestrator.clone();
    let out = out.clone();
    tokio::spawn(async move {
        let value = match orchestrator.handle(command).await {
            Ok(reply) => serde_json::to_value(&reply)
                .unwrap_or_else(|e| serde_json::json!({"reply": "error", "message": e.to_string()})),
            Err(e) => serde_json::json!({"reply": "error", "message": format!("{e:#}")}),
        };
        let _ = out.send(value);
    });
}

async fn write_json_lines(mut rx: mpsc::UnboundedReceiver<serde_json::Value>) {
    let mut stdout = tokio::io::stdout();
    while let Some(value) = rx.recv().await {
        let mut line = value.to_string();
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            error!("stdout write failed: {e}");
            break;
        }
        let _ = stdout.flush().await;
    }
}

/// Handle status command - probe every configured port
async fn handle_status(cfg: &AppConfig) -> Result<()> {
    let timeout = Duration::from_secs(1);
    let mut inference_up = false;

    for service in [&cfg.inference, &cfg.http, &cfg.download] {
        let up = probe::is_open(&service.host, service.port, timeout).await;
        if service.name == cfg.inference.name {
            inference_up = up;
        }
        println!(
            "{:<10} {}:{:<5} {}",
            service.name,
            service.host,
            service.port,
            if up { "up" } else { "down" }
        );
    }

    std::process::exit(if inference_up { 0 } else { 1 });
}

/// Handle prompt command - one-shot channel round trip
async fn handle_prompt(cfg: &AppConfig, text: &str, connect_timeout: Duration) -> Result<()> {
    let channel = MessageChannel::new(
        cfg.channel.url.clone(),
        Duration::from_millis(cfg.channel.reconnect_delay_ms),
    );
    let mut events = channel.subscribe();
    channel.connect();

    tokio::time::timeout(connect_timeout, async {
        loop {
            if let Ok(ChannelEvent::Ready) = events.recv().await {
                return;
            }
        }
    })
    .await
    .with_context(|| format!("could not connect to {} within {connect_timeout:?}", cfg.channel.url))?;

    let prompt_id = channel
        .send(text)
        .context("channel dropped before the prompt could be sent")?;

    let mut stdout = tokio::io::stdout();
    let result = loop {
        match events.recv().await {
            Ok(ChannelEvent::Token { prompt_id: id, token }) if id == prompt_id => {
                stdout.write_all(token.as_bytes()).await?;
                stdout.flush().await?;
            }
            Ok(ChannelEvent::Complete { prompt_id: Some(id) }) if id == prompt_id => {
                stdout.write_all(b"\n").await?;
                break Ok(());
            }
            Ok(ChannelEvent::Canceled { prompt_id: Some(id) }) if id == prompt_id => {
                break Err(anyhow::anyhow!("prompt canceled by server"));
            }
            Ok(ChannelEvent::Error { prompt_id: id, error })
                if id.is_none() || id.as_deref() == Some(prompt_id.as_str()) =>
            {
                break Err(anyhow::anyhow!("inference error: {error}"));
            }
            Ok(ChannelEvent::Disconnected) => {
                break Err(anyhow::anyhow!("connection lost before completion"));
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break Err(anyhow::anyhow!("channel closed")),
        }
    };

    channel.shutdown();
    result
}

// Cheap, polling‑based signal handling (lock‑free).
static RECEIVED_SIGNAL: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(0);

#[cfg(unix)]
fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{self, Signal};
    extern "C" fn handler(sig: i32) {
        RECEIVED_SIGNAL.store(sig, std::sync::atomic::Ordering::SeqCst);
    }
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        let action = signal::SigAction::new(
            signal::SigHandler::Handler(handler),
            signal::SaFlags::empty(),
            signal::SigSet::empty(),
        );
        // SAFETY: the handler only performs an atomic store.
        unsafe { signal::sigaction(sig, &action) }
            .map_err(|e| anyhow::anyhow!("Failed to register {sig} handler: {e}"))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers() -> Result<()> {
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            RECEIVED_SIGNAL.store(2, std::sync::atomic::Ordering::SeqCst);
        }
    });
    Ok(())
}

/// Non‑blocking check – returns the signal name once.
fn check_signals() -> Option<String> {
    let val = RECEIVED_SIGNAL.swap(0, std::sync::atomic::Ordering::AcqRel);
    if val == 0 {
        return None;
    }

    #[cfg(unix)]
    {
        match nix::sys::signal::Signal::try_from(val) {
            Ok(sig) => Some(sig.to_string()),
            Err(e) => {
                error!("BUG: Invalid signal number {val} from signal handler: {e}");
                None
            }
        }
    }
    #[cfg(not(unix))]
    {
        Some(format!("signal {val}"))
    }
}
