//! Readiness polling used after every (re)start before a service is declared usable.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::probe;

/// A pluggable "is it up yet" predicate.
pub trait ReadinessCheck: Send + Sync {
    fn check(&self) -> BoxFuture<'_, bool>;

    /// Human readable target, for logs.
    fn describe(&self) -> String;
}

/// Ready once the port accepts connections.
#[derive(Debug, Clone)]
pub struct PortCheck {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl PortCheck {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl ReadinessCheck for PortCheck {
    fn check(&self) -> BoxFuture<'_, bool> {
        Box::pin(probe::is_open(&self.host, self.port, self.connect_timeout))
    }

    fn describe(&self) -> String {
        format!("tcp {}:{}", self.host, self.port)
    }
}

/// Ready once the health endpoint answers 2xx with a healthy body.
#[derive(Debug, Clone)]
pub struct HttpCheck {
    pub client: reqwest::Client,
    pub url: String,
}

impl HttpCheck {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: probe::health_client(),
            url: url.into(),
        }
    }
}

impl ReadinessCheck for HttpCheck {
    fn check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            probe::http_health(&self.client, &self.url)
                .await
                .is_some_and(|body| probe::body_is_healthy(&body))
        })
    }

    fn describe(&self) -> String {
        format!("http {}", self.url)
    }
}

/// Adapter for ad-hoc predicates.
pub struct FnCheck<F> {
    label: String,
    f: F,
}

impl<F> FnCheck<F>
where
    F: Fn() -> BoxFuture<'static, bool> + Send + Sync,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            f,
        }
    }
}

impl<F> ReadinessCheck for FnCheck<F>
where
    F: Fn() -> BoxFuture<'static, bool> + Send + Sync,
{
    fn check(&self) -> BoxFuture<'_, bool> {
        (self.f)()
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Outcome of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    /// The owner was torn down while we were polling.
    Cancelled,
}

/// Poll `check` every `interval` until it succeeds, `timeout` elapses, or
/// `cancel` fires.
///
/// Cancellation is observed both between ticks and while a probe is in
/// flight, so teardown never waits out the full timeout.
pub async fn wait_ready(
    check: &dyn ReadinessCheck,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Readiness {
    let started = Instant::now();
    let deadline = started + timeout;
    let target = check.describe();

    log::debug!("waiting up to {timeout:?} for {target}");

    loop {
        let ok = tokio::select! {
            ok = check.check() => ok,
            () = cancel.cancelled() => {
                log::debug!("readiness wait for {target} cancelled");
                return Readiness::Cancelled;
            }
        };

        if ok {
            log::debug!("{target} ready after {:?}", started.elapsed());
            return Readiness::Ready;
        }

        let now = Instant::now();
        if now >= deadline {
            log::debug!("{target} not ready after {timeout:?}");
            return Readiness::TimedOut;
        }

        tokio::select! {
            () = tokio::time::sleep(interval.min(deadline - now)) => {}
            () = cancel.cancelled() => {
                log::debug!("readiness wait for {target} cancelled");
                return Readiness::Cancelled;
            }
        }
    }
}
