//! Configuration-level rollback after a failed stage.
//!
//! Rollback never touches data volumes. It stops what the driver reports as
//! still (partially) running and puts the last ConfigSnapshot back in place.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::driver::{ComponentDriver, DriverState};
use crate::error::{Result, StackupError};
use crate::snapshot::{ConfigSnapshot, SnapshotStore};
use crate::types::DeploymentStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RollbackOutcome {
    RolledBack { stopped: bool, restored: bool },
    NothingToRollBack,
    RollbackFailed { diagnostic: String },
}

impl RollbackOutcome {
    /// Escalate a failed rollback into the fatal error it stands for.
    pub fn into_error(self, component: &str) -> Option<StackupError> {
        match self {
            RollbackOutcome::RollbackFailed { diagnostic } => Some(StackupError::RollbackFailed {
                component: component.to_string(),
                diagnostic,
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackOutcome::RolledBack { stopped, restored } => match (stopped, restored) {
                (true, true) => f.write_str("stopped and restored previous config"),
                (true, false) => f.write_str("stopped (no snapshot to restore)"),
                (false, true) => f.write_str("restored previous config"),
                (false, false) => f.write_str("rolled back"),
            },
            RollbackOutcome::NothingToRollBack => f.write_str("nothing to roll back"),
            RollbackOutcome::RollbackFailed { diagnostic } => {
                write!(f, "rollback failed: {diagnostic}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RollbackController {
    snapshots: Arc<SnapshotStore>,
}

impl RollbackController {
    pub fn new(snapshots: Arc<SnapshotStore>) -> Self {
        Self { snapshots }
    }

    /// React to a stage ending in `status`. Only `Failed` triggers a rollback.
    pub async fn on_failure(
        &self,
        component: &str,
        driver: &dyn ComponentDriver,
        status: DeploymentStatus,
    ) -> RollbackOutcome {
        if status != DeploymentStatus::Failed {
            return RollbackOutcome::NothingToRollBack;
        }
        self.roll_back(component, driver).await
    }

    /// Unconditional rollback, also used by `stackup rollback <component>`.
    pub async fn roll_back(&self, component: &str, driver: &dyn ComponentDriver) -> RollbackOutcome {
        let state = match driver.status().await {
            Ok(state) => state,
            Err(e) => {
                warn!(component, error = %e, "status query failed during rollback; assuming partially started");
                DriverState::PartiallyStarted
            }
        };

        let stopped = if state.needs_stop() {
            if let Err(e) = driver.stop().await {
                return RollbackOutcome::RollbackFailed {
                    diagnostic: format!("stop: {}", e.diagnostic),
                };
            }
            true
        } else {
            false
        };

        let snapshot = match self.snapshots.latest(component) {
            Ok(s) => s,
            Err(e) => {
                return RollbackOutcome::RollbackFailed {
                    diagnostic: format!("reading snapshot: {e}"),
                }
            }
        };

        let restored = match snapshot {
            Some(snap) => {
                // A stopped service has nothing to reload; deploying the
                // snapshot writes it back and starts the previous version.
                let res = if stopped {
                    driver.deploy(&snap.content).await
                } else {
                    driver.apply_config(&snap.content).await
                };
                if let Err(e) = res {
                    return RollbackOutcome::RollbackFailed {
                        diagnostic: e.diagnostic,
                    };
                }
                info!(component, run_seq = snap.meta.run_seq, "restored config snapshot");
                true
            }
            None => false,
        };

        if !stopped && !restored {
            RollbackOutcome::NothingToRollBack
        } else {
            RollbackOutcome::RolledBack { stopped, restored }
        }
    }

    /// Put `snapshot` back with an in-place reload. Failure is fatal.
    pub async fn restore(
        &self,
        component: &str,
        driver: &dyn ComponentDriver,
        snapshot: &ConfigSnapshot,
    ) -> Result<()> {
        driver
            .apply_config(&snapshot.content)
            .await
            .map_err(|e| StackupError::RollbackFailed {
                component: component.to_string(),
                diagnostic: e.diagnostic,
            })?;
        info!(component, run_seq = snapshot.meta.run_seq, "restored config snapshot");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ConfigBlob, DriverFailure, DriverResult};
    use crate::snapshot::SnapshotReason;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        state: Mutex<Option<DriverState>>,
        calls: Mutex<Vec<String>>,
        fail_apply: bool,
    }

    impl Recorder {
        fn with_state(state: DriverState) -> Self {
            Self {
                state: Mutex::new(Some(state)),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ComponentDriver for Recorder {
        async fn deploy(&self, config: &ConfigBlob) -> DriverResult {
            self.calls
                .lock()
                .unwrap()
                .push(format!("deploy:{}", config.as_text()));
            Ok(())
        }

        async fn status(&self) -> DriverResult<DriverState> {
            Ok(self.state.lock().unwrap().unwrap_or(DriverState::Unknown))
        }

        async fn stop(&self) -> DriverResult {
            self.calls.lock().unwrap().push("stop".into());
            Ok(())
        }

        async fn current_config(&self) -> DriverResult<ConfigBlob> {
            Ok(ConfigBlob::default())
        }

        async fn apply_config(&self, config: &ConfigBlob) -> DriverResult {
            if self.fail_apply {
                return Err(DriverFailure::new("reload refused"));
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("apply:{}", config.as_text()));
            Ok(())
        }
    }

    fn controller() -> (TempDir, Arc<SnapshotStore>, RollbackController) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SnapshotStore::open(dir.path()).unwrap());
        let ctl = RollbackController::new(store.clone());
        (dir, store, ctl)
    }

    #[tokio::test]
    async fn non_failed_status_is_a_noop() {
        let (_dir, _store, ctl) = controller();
        let driver = Recorder::with_state(DriverState::PartiallyStarted);
        let out = ctl
            .on_failure("vault", &driver, DeploymentStatus::Succeeded)
            .await;
        assert_eq!(out, RollbackOutcome::NothingToRollBack);
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn stopped_service_without_snapshot_has_nothing_to_do() {
        let (_dir, _store, ctl) = controller();
        let driver = Recorder::with_state(DriverState::Stopped);
        let out = ctl.on_failure("vault", &driver, DeploymentStatus::Failed).await;
        assert_eq!(out, RollbackOutcome::NothingToRollBack);
    }

    #[tokio::test]
    async fn partial_start_is_stopped_and_snapshot_redeployed() {
        let (_dir, store, ctl) = controller();
        store
            .take("vault", 1, SnapshotReason::PreDeploy, &ConfigBlob::from("v1"))
            .unwrap();
        let driver = Recorder::with_state(DriverState::PartiallyStarted);
        let out = ctl.on_failure("vault", &driver, DeploymentStatus::Failed).await;
        assert_eq!(
            out,
            RollbackOutcome::RolledBack {
                stopped: true,
                restored: true
            }
        );
        assert_eq!(driver.calls(), vec!["stop", "deploy:v1"]);
    }

    #[tokio::test]
    async fn snapshot_restored_in_place_when_already_stopped() {
        let (_dir, store, ctl) = controller();
        store
            .take("nomad", 1, SnapshotReason::PhaseTransition, &ConfigBlob::from("old"))
            .unwrap();
        let driver = Recorder::with_state(DriverState::Stopped);
        let out = ctl.roll_back("nomad", &driver).await;
        assert_eq!(
            out,
            RollbackOutcome::RolledBack {
                stopped: false,
                restored: true
            }
        );
        assert_eq!(driver.calls(), vec!["apply:old"]);
    }

    #[tokio::test]
    async fn failed_restore_is_reported() {
        let (_dir, store, ctl) = controller();
        store
            .take("nomad", 1, SnapshotReason::PhaseTransition, &ConfigBlob::from("old"))
            .unwrap();
        let driver = Recorder {
            state: Mutex::new(Some(DriverState::Stopped)),
            fail_apply: true,
            ..Default::default()
        };
        let out = ctl.roll_back("nomad", &driver).await;
        let err = out.into_error("nomad").unwrap();
        assert!(matches!(err, StackupError::RollbackFailed { .. }));
        assert!(err.to_string().contains("reload refused"));
    }
}
