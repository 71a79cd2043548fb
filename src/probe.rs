//! Port and health probes.
//!
//! Every probe here collapses failure into a negative answer; none of them
//! return errors to the caller.

use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpStream;

/// Check whether `host:port` accepts a TCP connection within `timeout`.
///
/// The transient socket is dropped immediately after connecting.
pub async fn is_open(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        Ok(Err(e)) => {
            log::trace!("{host}:{port} refused: {e}");
            false
        }
        Err(_) => {
            log::trace!("{host}:{port} connect timed out after {timeout:?}");
            false
        }
    }
}

/// GET a `/health` style endpoint.
///
/// Returns the decoded body for a 2xx response (`Value::Null` if the body is
/// not JSON), `None` for anything else.
pub async fn http_health(client: &reqwest::Client, url: &str) -> Option<Value> {
    let response = match client.get(url).send().await {
        Ok(r) => r,
        Err(e) => {
            log::trace!("health request to {url} failed: {e}");
            return None;
        }
    };

    if !response.status().is_success() {
        log::debug!("health check {url} returned status {}", response.status());
        return None;
    }

    match response.bytes().await {
        Ok(body) => Some(serde_json::from_slice(&body).unwrap_or(Value::Null)),
        Err(e) => {
            log::debug!("health body from {url} unreadable: {e}");
            None
        }
    }
}

/// A health body counts as healthy when it says `status: "ok"` or carries no
/// JSON at all.
#[must_use]
pub fn body_is_healthy(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::Object(map) => map.get("status").and_then(Value::as_str) == Some("ok"),
        _ => false,
    }
}

/// Build the short-timeout client used for all health probes.
#[must_use]
pub fn health_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|e| {
            log::warn!("falling back to default HTTP client: {e}");
            reqwest::Client::new()
        })
}

/// PIDs of processes listening on `port`, looked up with the platform's
/// process-listing tool. Empty when nothing is found or the tool is missing.
pub async fn pids_on_port(port: u16) -> Vec<u32> {
    let output = match port_listing_command(port).output().await {
        Ok(o) => o,
        Err(e) => {
            log::debug!("port owner lookup for {port} unavailable: {e}");
            return Vec::new();
        }
    };

    parse_port_owners(&String::from_utf8_lossy(&output.stdout), port)
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        fn port_listing_command(_port: u16) -> tokio::process::Command {
            let mut cmd = tokio::process::Command::new("netstat");
            cmd.arg("-ano");
            cmd
        }
    } else {
        // listeners only; clients connected to the port are not owners
        fn port_listing_command(port: u16) -> tokio::process::Command {
            let mut cmd = tokio::process::Command::new("lsof");
            cmd.arg("-nP")
                .arg(format!("-iTCP:{port}"))
                .args(["-sTCP:LISTEN", "-t"]);
            cmd
        }
    }
}

#[cfg(windows)]
fn parse_port_owners(stdout: &str, port: u16) -> Vec<u32> {
    let needle = format!(":{port}");
    stdout
        .lines()
        .filter(|line| line.contains("LISTENING"))
        .filter(|line| {
            line.split_whitespace()
                .nth(1)
                .is_some_and(|local| local.ends_with(&needle))
        })
        .filter_map(|line| line.split_whitespace().last()?.parse().ok())
        .collect()
}

#[cfg(not(windows))]
fn parse_port_owners(stdout: &str, _port: u16) -> Vec<u32> {
    let mut pids: Vec<u32> = stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Best-effort termination of whatever is bound to `port`.
///
/// Used when a stale instance from a previous run still owns a service port.
pub async fn kill_port_owners(port: u16) {
    let own_pid = std::process::id();
    let pids: Vec<u32> = pids_on_port(port)
        .await
        .into_iter()
        .filter(|pid| *pid != own_pid)
        .collect();

    if pids.is_empty() {
        log::debug!("no process found owning port {port}");
        return;
    }

    for pid in &pids {
        log::warn!("terminating stale process {pid} bound to port {port}");
        terminate_pid(*pid).await;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
}

#[cfg(unix)]
async fn terminate_pid(pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
        log::debug!("SIGTERM to {pid} failed (already gone?): {e}");
    }
}

#[cfg(windows)]
async fn terminate_pid(pid: u32) {
    let result = tokio::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .output()
        .await;
    if let Err(e) = result {
        log::debug!("taskkill {pid} failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn open_port_is_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_open("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn closed_port_collapses_to_false() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!is_open("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn unresolvable_host_collapses_to_false() {
        assert!(!is_open("host.invalid", 80, Duration::from_millis(500)).await);
    }

    #[test]
    fn health_body_rules() {
        assert!(body_is_healthy(&Value::Null));
        assert!(body_is_healthy(&serde_json::json!({"status": "ok", "active_downloads": 2})));
        assert!(!body_is_healthy(&serde_json::json!({"status": "loading"})));
        assert!(!body_is_healthy(&serde_json::json!([1, 2])));
    }

    #[cfg(not(windows))]
    #[test]
    fn lsof_output_parsing() {
        assert_eq!(parse_port_owners("456\n123\n\n456\n", 8765), vec![123, 456]);
        assert!(parse_port_owners("", 8765).is_empty());
    }

    #[cfg(not(windows))]
    #[test]
    fn lsof_asks_for_listeners_only() {
        let cmd = port_listing_command(8765);
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.as_std().get_program(), "lsof");
        assert_eq!(args, ["-nP", "-iTCP:8765", "-sTCP:LISTEN", "-t"]);
    }
}
