//! The uniform lifecycle boundary every concrete service sits behind.
//!
//! The orchestrator, phase controller and rollback controller only ever call
//! the five methods of [`ComponentDriver`]. Installing binaries, creating
//! users, templating files and talking to package managers all live behind
//! it. [`ScriptDriver`] is the stock implementation: each lifecycle step is
//! an operator-supplied shell command, and the driver owns exactly one
//! configuration file on disk.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::io;

// ---------------------------------------------------------------------------
// Boundary types
// ---------------------------------------------------------------------------

/// A component's active configuration. Opaque to everything except the
/// driver that owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigBlob(Vec<u8>);

impl ConfigBlob {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl From<String> for ConfigBlob {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&str> for ConfigBlob {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

/// The `ok == false` half of the driver contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{diagnostic}")]
pub struct DriverFailure {
    pub diagnostic: String,
}

impl DriverFailure {
    pub fn new(diagnostic: impl Into<String>) -> Self {
        Self {
            diagnostic: diagnostic.into(),
        }
    }
}

pub type DriverResult<T = ()> = std::result::Result<T, DriverFailure>;

/// What a driver reports about its running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Running,
    Stopped,
    /// Some processes are up but the service is not fully started.
    PartiallyStarted,
    /// The driver has no way to tell.
    Unknown,
}

impl DriverState {
    /// Anything other than a confirmed stop may leave processes behind.
    pub fn needs_stop(self) -> bool {
        !matches!(self, DriverState::Stopped)
    }
}

#[async_trait]
pub trait ComponentDriver: Send + Sync {
    /// Install, configure and start the service with `config`.
    async fn deploy(&self, config: &ConfigBlob) -> DriverResult;

    async fn status(&self) -> DriverResult<DriverState>;

    async fn stop(&self) -> DriverResult;

    /// The configuration the service is running with right now. Empty when
    /// nothing has been deployed yet.
    async fn current_config(&self) -> DriverResult<ConfigBlob>;

    /// Replace the active configuration and reload the service in place.
    async fn apply_config(&self, config: &ConfigBlob) -> DriverResult;
}

// ---------------------------------------------------------------------------
// ScriptDriver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverCommands {
    pub deploy: String,
    pub stop: String,
    /// Exit 0 = running, 3 = stopped, anything else = partially started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Signal the service to re-read its configuration without restarting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload: Option<String>,
    /// Path of the configuration file this driver owns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    600
}

/// LSB `status` exit code for "program is not running".
const STATUS_NOT_RUNNING: i32 = 3;

/// Combined stdout/stderr kept from a failing command.
const MAX_OUTPUT: usize = 10 * 1024;

#[derive(Debug, Clone)]
pub struct ScriptDriver {
    component: String,
    commands: DriverCommands,
    config_path: PathBuf,
    workdir: PathBuf,
    env: Vec<(String, String)>,
}

impl ScriptDriver {
    pub fn new(
        component: impl Into<String>,
        commands: DriverCommands,
        config_path: PathBuf,
        workdir: &Path,
    ) -> Self {
        Self {
            component: component.into(),
            commands,
            config_path,
            workdir: workdir.to_path_buf(),
            env: Vec::new(),
        }
    }

    /// Extra environment passed to every command (version pins, addresses).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    async fn run(&self, step: &str, command: &str) -> DriverResult<i32> {
        debug!(component = %self.component, step, command, "running driver command");
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .env("STACKUP_COMPONENT", &self.component)
            .env("STACKUP_CONFIG_PATH", &self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let timeout = Duration::from_secs(self.commands.timeout_secs);
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                return Err(DriverFailure::new(format!(
                    "{step}: failed to spawn '{command}': {e}"
                )))
            }
            Err(_) => {
                return Err(DriverFailure::new(format!(
                    "{step}: timed out after {}s",
                    timeout.as_secs()
                )))
            }
        };

        let code = output.status.code().unwrap_or(-1);
        if code != 0 && step != "status" {
            let text = combined_output(&output.stdout, &output.stderr);
            return Err(DriverFailure::new(if text.is_empty() {
                format!("{step}: exited with code {code}")
            } else {
                format!("{step}: exited with code {code}: {text}")
            }));
        }
        Ok(code)
    }
}

#[async_trait]
impl ComponentDriver for ScriptDriver {
    async fn deploy(&self, config: &ConfigBlob) -> DriverResult {
        if !config.is_empty() {
            io::atomic_write(&self.config_path, config.as_bytes()).map_err(|e| {
                DriverFailure::new(format!(
                    "writing {}: {e}",
                    self.config_path.display()
                ))
            })?;
        }
        self.run("deploy", &self.commands.deploy).await.map(|_| ())
    }

    async fn status(&self) -> DriverResult<DriverState> {
        let Some(command) = &self.commands.status else {
            return Ok(DriverState::Unknown);
        };
        Ok(match self.run("status", command).await? {
            0 => DriverState::Running,
            STATUS_NOT_RUNNING => DriverState::Stopped,
            _ => DriverState::PartiallyStarted,
        })
    }

    async fn stop(&self) -> DriverResult {
        self.run("stop", &self.commands.stop).await.map(|_| ())
    }

    async fn current_config(&self) -> DriverResult<ConfigBlob> {
        io::read_or_empty(&self.config_path)
            .map(ConfigBlob::new)
            .map_err(|e| DriverFailure::new(format!("reading {}: {e}", self.config_path.display())))
    }

    async fn apply_config(&self, config: &ConfigBlob) -> DriverResult {
        io::atomic_write(&self.config_path, config.as_bytes()).map_err(|e| {
            DriverFailure::new(format!("writing {}: {e}", self.config_path.display()))
        })?;
        match &self.commands.reload {
            Some(reload) => self.run("reload", reload).await.map(|_| ()),
            None => Ok(()),
        }
    }
}

/// Combine stdout/stderr and cap to 10KB (keeping the tail).
fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    let output = match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (_, true) => stdout.trim().to_string(),
        (true, false) => stderr.trim().to_string(),
        (false, false) => format!("{}\n{}", stdout.trim(), stderr.trim()),
    };
    if output.len() > MAX_OUTPUT {
        let mut start = output.len() - MAX_OUTPUT;
        while !output.is_char_boundary(start) {
            start += 1;
        }
        output[start..].to_string()
    } else {
        output
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
