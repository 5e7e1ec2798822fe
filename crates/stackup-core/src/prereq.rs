//! Pre-run checks: every required executable is on `PATH` and every required
//! network target accepts a TCP connection. Any miss aborts the run before a
//! single component is touched.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StackupError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Prerequisites {
    /// Executables looked up on `PATH`.
    #[serde(default)]
    pub tools: Vec<String>,
    /// `host:port` targets that must accept a connection.
    #[serde(default)]
    pub network: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    3
}

impl Prerequisites {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.network.is_empty()
    }

    /// Run every check and report all misses together.
    pub async fn check(&self) -> Result<()> {
        let mut missing = Vec::new();

        for tool in &self.tools {
            match which::which(tool) {
                Ok(path) => debug!(tool, path = %path.display(), "tool found"),
                Err(_) => missing.push(format!("tool '{tool}' not found on PATH")),
            }
        }

        let timeout = Duration::from_secs(self.connect_timeout_secs.max(1));
        for target in &self.network {
            match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(target.as_str())).await {
                Ok(Ok(_)) => debug!(target = %target, "network target reachable"),
                Ok(Err(e)) => missing.push(format!("'{target}' unreachable: {e}")),
                Err(_) => missing.push(format!(
                    "'{target}' did not accept a connection within {}s",
                    timeout.as_secs()
                )),
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(StackupError::Prerequisite(missing.join("; ")))
        }
    }
}
