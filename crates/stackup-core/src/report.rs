use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::rollback::RollbackOutcome;
use crate::types::{BootstrapPhase, ComponentKind, DeploymentStatus, Environment};

fn as_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

// ---------------------------------------------------------------------------
// ComponentReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub name: String,
    pub kind: ComponentKind,
    pub rank: u32,
    pub soft: bool,
    pub status: DeploymentStatus,
    /// Success note, skip reason, or the causing diagnostic for a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Deploy attempts made (0 when skipped).
    pub attempts: u32,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackOutcome>,
}

impl ComponentReport {
    pub fn skipped(
        name: &str,
        kind: ComponentKind,
        rank: u32,
        soft: bool,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            rank,
            soft,
            status: DeploymentStatus::Skipped,
            message: Some(reason.into()),
            attempts: 0,
            elapsed: Duration::ZERO,
            rollback: None,
        }
    }
}

// ---------------------------------------------------------------------------
// DeploymentReport
// ---------------------------------------------------------------------------

/// Read-only summary of one run, in plan order.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_seq: Option<u64>,
    pub environment: Environment,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub components: Vec<ComponentReport>,
    /// Component names grouped by stage, lowest rank first.
    pub stages: Vec<Vec<String>>,
    /// Substrate bootstrap phase at the end of the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<BootstrapPhase>,
    /// Non-fatal problems, e.g. a failed secrets integration.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// The error that aborted the run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
    #[serde(skip)]
    pub fatal_exit_code: Option<i32>,
    pub exit_code: i32,
}

impl DeploymentReport {
    pub fn new(environment: Environment, dry_run: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: None,
            run_seq: None,
            environment,
            dry_run,
            started_at,
            elapsed: Duration::ZERO,
            components: Vec::new(),
            stages: Vec::new(),
            phase: None,
            warnings: Vec::new(),
            fatal: None,
            fatal_exit_code: None,
            exit_code: 0,
        }
    }

    pub fn component(&self, name: &str) -> Option<&ComponentReport> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn status_of(&self, name: &str) -> Option<DeploymentStatus> {
        self.component(name).map(|c| c.status)
    }

    pub fn count(&self, status: DeploymentStatus) -> usize {
        self.components.iter().filter(|c| c.status == status).count()
    }

    /// `0` when nothing failed, `1` when any component failed (soft or hard),
    /// or the aborting error's own code.
    pub fn compute_exit_code(&self) -> i32 {
        if let Some(code) = self.fatal_exit_code {
            return code;
        }
        if self.count(DeploymentStatus::Failed) > 0 {
            1
        } else {
            0
        }
    }

    /// Fix `exit_code` once every component has its final status.
    pub fn finalize(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
        self.exit_code = self.compute_exit_code();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(name: &str, status: DeploymentStatus, soft: bool) -> ComponentReport {
        ComponentReport {
            name: name.into(),
            kind: ComponentKind::Gateway,
            rank: 0,
            soft,
            status,
            message: None,
            attempts: 1,
            elapsed: Duration::from_millis(1500),
            rollback: None,
        }
    }

    #[test]
    fn exit_code_reflects_failures() {
        let mut r = DeploymentReport::new(Environment::Develop, false, Utc::now());
        r.components.push(component("a", DeploymentStatus::Succeeded, false));
        r.components.push(component("b", DeploymentStatus::Skipped, false));
        r.finalize(Duration::from_secs(3));
        assert_eq!(r.exit_code, 0);

        r.components.push(component("c", DeploymentStatus::Failed, true));
        r.finalize(Duration::from_secs(3));
        assert_eq!(r.exit_code, 1);
    }

    #[test]
    fn fatal_code_wins() {
        let mut r = DeploymentReport::new(Environment::Develop, false, Utc::now());
        r.fatal = Some("precondition failed".into());
        r.fatal_exit_code = Some(2);
        r.finalize(Duration::ZERO);
        assert_eq!(r.exit_code, 2);
    }

    #[test]
    fn json_shape() {
        let mut r = DeploymentReport::new(Environment::Staging, false, Utc::now());
        r.components.push(component("traefik", DeploymentStatus::Succeeded, false));
        r.finalize(Duration::from_millis(2500));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["environment"], "staging");
        assert_eq!(v["elapsed_ms"], 2500);
        assert_eq!(v["components"][0]["status"], "succeeded");
        assert_eq!(v["components"][0]["elapsed_ms"], 1500);
        assert!(v.get("fatal").is_none());
    }
}
