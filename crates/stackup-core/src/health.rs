//! Readiness gating between deployment stages.
//!
//! A [`HealthCheckDescriptor`] pairs a [`ReadinessProbe`] with a polling
//! interval and an overall timeout. [`HealthMonitor::wait_ready`] polls until
//! the probe reports ready, the timeout elapses, or the run is cancelled.
//! Individual poll failures are only logged; the caller sees a single
//! [`Readiness`] verdict carrying the last diagnostic.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, StackupError};

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// Result of a single readiness poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub ready: bool,
    pub diagnostic: Option<String>,
}

impl ProbeOutcome {
    pub fn ready() -> Self {
        Self {
            ready: true,
            diagnostic: None,
        }
    }

    pub fn not_ready(diagnostic: impl Into<String>) -> Self {
        Self {
            ready: false,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// A readiness predicate. The monitor only cares about the boolean outcome
/// and an optional diagnostic, never about the transport.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;

    /// Short human-readable description used in logs.
    fn describe(&self) -> String;
}

/// `GET url` returns any 2xx status.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self) -> ProbeOutcome {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::ready(),
            Ok(resp) => ProbeOutcome::not_ready(format!("GET {} returned {}", self.url, resp.status())),
            Err(e) => ProbeOutcome::not_ready(format!("GET {} failed: {e}", self.url)),
        }
    }

    fn describe(&self) -> String {
        format!("http {}", self.url)
    }
}

/// Leader election has a value: `GET url` returns 2xx with a non-empty body
/// once quotes and whitespace are stripped (the scheduler answers `""` while
/// no leader is elected).
pub struct LeaderProbe {
    client: reqwest::Client,
    url: String,
}

impl LeaderProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for LeaderProbe {
    async fn probe(&self) -> ProbeOutcome {
        let resp = match self.client.get(&self.url).send().await {
            Ok(r) => r,
            Err(e) => return ProbeOutcome::not_ready(format!("GET {} failed: {e}", self.url)),
        };
        if !resp.status().is_success() {
            return ProbeOutcome::not_ready(format!("GET {} returned {}", self.url, resp.status()));
        }
        match resp.text().await {
            Ok(body) if !body.trim().trim_matches('"').is_empty() => ProbeOutcome::ready(),
            Ok(_) => ProbeOutcome::not_ready("no leader elected yet"),
            Err(e) => ProbeOutcome::not_ready(format!("reading leader response: {e}")),
        }
    }

    fn describe(&self) -> String {
        format!("leader {}", self.url)
    }
}

/// Process-status query: `sh -c command` exits 0.
pub struct CommandProbe {
    command: String,
}

impl CommandProbe {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for CommandProbe {
    async fn probe(&self) -> ProbeOutcome {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => ProbeOutcome::ready(),
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    ProbeOutcome::not_ready(format!("'{}' exited with {}", self.command, out.status))
                } else {
                    ProbeOutcome::not_ready(stderr.to_string())
                }
            }
            Err(e) => ProbeOutcome::not_ready(format!("failed to spawn '{}': {e}", self.command)),
        }
    }

    fn describe(&self) -> String {
        format!("command `{}`", self.command)
    }
}

/// Wraps a closure; handy for embedding and for tests.
pub struct FnProbe<F> {
    label: String,
    f: F,
}

impl<F> FnProbe<F>
where
    F: Fn() -> ProbeOutcome + Send + Sync,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> ReadinessProbe for FnProbe<F>
where
    F: Fn() -> ProbeOutcome + Send + Sync,
{
    async fn probe(&self) -> ProbeOutcome {
        (self.f)()
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

// ---------------------------------------------------------------------------
// ProbeSpec: declarative form used in stack.yaml
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeSpec {
    Http {
        url: String,
        #[serde(default)]
        tls_skip_verify: bool,
    },
    Leader {
        url: String,
        #[serde(default)]
        tls_skip_verify: bool,
    },
    Command {
        command: String,
    },
}

impl ProbeSpec {
    pub fn build(&self, request_timeout: Duration) -> Result<Arc<dyn ReadinessProbe>> {
        match self {
            ProbeSpec::Http {
                url,
                tls_skip_verify,
            } => Ok(Arc::new(HttpProbe::new(
                http_client(request_timeout, *tls_skip_verify)?,
                url.clone(),
            ))),
            ProbeSpec::Leader {
                url,
                tls_skip_verify,
            } => Ok(Arc::new(LeaderProbe::new(
                http_client(request_timeout, *tls_skip_verify)?,
                url.clone(),
            ))),
            ProbeSpec::Command { command } => Ok(Arc::new(CommandProbe::new(command.clone()))),
        }
    }
}

fn http_client(timeout: Duration, skip_verify: bool) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(skip_verify)
        .build()
        .map_err(|e| StackupError::InvalidConfig(format!("building http client: {e}")))
}

// ---------------------------------------------------------------------------
// HealthCheckDescriptor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HealthCheckDescriptor {
    pub target: String,
    pub probe: Arc<dyn ReadinessProbe>,
    pub interval: Duration,
    pub timeout: Duration,
}

impl HealthCheckDescriptor {
    /// Build a descriptor, enforcing `timeout > interval > 0`.
    pub fn new(
        target: impl Into<String>,
        probe: Arc<dyn ReadinessProbe>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let target = target.into();
        if interval.is_zero() {
            return Err(StackupError::InvalidDescriptor {
                target,
                reason: "interval must be greater than zero".into(),
            });
        }
        if timeout <= interval {
            return Err(StackupError::InvalidDescriptor {
                target,
                reason: format!(
                    "timeout ({}ms) must exceed interval ({}ms)",
                    timeout.as_millis(),
                    interval.as_millis()
                ),
            });
        }
        Ok(Self {
            target,
            probe,
            interval,
            timeout,
        })
    }
}

impl fmt::Debug for HealthCheckDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheckDescriptor")
            .field("target", &self.target)
            .field("probe", &self.probe.describe())
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready {
        attempts: u32,
        elapsed: Duration,
    },
    TimedOut {
        attempts: u32,
        elapsed: Duration,
        last_error: Option<String>,
    },
    Cancelled {
        attempts: u32,
    },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HealthMonitor;

impl HealthMonitor {
    pub fn new() -> Self {
        Self
    }

    /// Poll `descriptor.probe` every `interval` until it succeeds, `timeout`
    /// elapses, or `cancel` fires. The first poll happens immediately and a
    /// successful poll returns without any further wait.
    pub async fn wait_ready(
        &self,
        descriptor: &HealthCheckDescriptor,
        cancel: &CancellationToken,
    ) -> Readiness {
        let start = Instant::now();
        let deadline = start + descriptor.timeout;
        let mut attempts = 0u32;

        let last_error = loop {
            if cancel.is_cancelled() {
                return Readiness::Cancelled { attempts };
            }
            attempts += 1;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Readiness::Cancelled { attempts },
                res = tokio::time::timeout(remaining, descriptor.probe.probe()) => res,
            };

            let diag = match polled {
                Ok(outcome) if outcome.ready => {
                    return Readiness::Ready {
                        attempts,
                        elapsed: start.elapsed(),
                    };
                }
                Ok(outcome) => {
                    let diag = outcome.diagnostic.unwrap_or_else(|| "not ready".into());
                    debug!(target_name = %descriptor.target, attempt = attempts, error = %diag, "health poll failed");
                    diag
                }
                Err(_) => {
                    debug!(target_name = %descriptor.target, attempt = attempts, "health poll hung until deadline");
                    "probe did not answer before the deadline".to_string()
                }
            };

            let now = Instant::now();
            if now >= deadline {
                break diag;
            }
            let next = (now + descriptor.interval).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Readiness::Cancelled { attempts },
                _ = tokio::time::sleep_until(next) => {}
            }
            if Instant::now() >= deadline {
                break diag;
            }
        };

        Readiness::TimedOut {
            attempts,
            elapsed: start.elapsed(),
            last_error: Some(last_error),
        }
    }

    /// Single poll, bounded by the descriptor's timeout.
    pub async fn check_now(&self, descriptor: &HealthCheckDescriptor) -> ProbeOutcome {
        match tokio::time::timeout(descriptor.timeout, descriptor.probe.probe()).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::not_ready(format!(
                "{} did not answer within {}s",
                descriptor.probe.describe(),
                descriptor.timeout.as_secs()
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
