//! Two-phase bootstrap of the substrate.
//!
//! The substrate is first deployed with secrets integration disabled, because
//! the secrets manager runs on it and cannot exist yet. Once the secrets
//! manager is healthy, [`PhaseController::enable_integration`] switches the
//! substrate over in place:
//!
//! 1. secrets manager must pass its health check right now
//! 2. snapshot the substrate's active config
//! 3. render the integrated config from the typed model
//! 4. reject it before apply if rendering or the syntax check fails
//! 5. apply and reload (no restart)
//! 6. re-check substrate health; on failure put the snapshot back
//! 7. persist `Integrated` and drop the snapshot
//!
//! The phase only ever moves forward. A failed switch leaves it at
//! `PreIntegration` so a later run can try again.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Result, StackupError};
use crate::health::{HealthCheckDescriptor, HealthMonitor, Readiness};
use crate::plan::ComponentSpec;
use crate::rollback::RollbackController;
use crate::snapshot::{SnapshotReason, SnapshotStore};
use crate::template::SecretsIntegration;
use crate::tracker::StateTracker;
use crate::types::BootstrapPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    /// The phase was already `Integrated`; nothing was done.
    AlreadyIntegrated,
    /// The substrate was switched over during this call.
    Integrated,
}

#[derive(Clone)]
pub struct PhaseController {
    tracker: Arc<StateTracker>,
    snapshots: Arc<SnapshotStore>,
    rollback: RollbackController,
    monitor: HealthMonitor,
}

impl PhaseController {
    pub fn new(tracker: Arc<StateTracker>, snapshots: Arc<SnapshotStore>) -> Self {
        Self {
            rollback: RollbackController::new(snapshots.clone()),
            tracker,
            snapshots,
            monitor: HealthMonitor::new(),
        }
    }

    pub fn phase(&self, substrate: &str) -> Result<BootstrapPhase> {
        self.tracker.phase(substrate)
    }

    /// Switch `substrate` to the secrets manager described by `integration`.
    ///
    /// Errors: `Precondition` when the secrets manager is not healthy,
    /// `IntegrationFailed` when the new config was rejected or the reloaded
    /// substrate did not come back healthy (the previous config is restored
    /// first), `RollbackFailed` when that restore itself failed.
    pub async fn enable_integration(
        &self,
        run_seq: u64,
        substrate: &ComponentSpec,
        secrets_health: &HealthCheckDescriptor,
        integration: &SecretsIntegration,
        cancel: &CancellationToken,
    ) -> Result<PhaseTransition> {
        let name = substrate.name.as_str();
        if self.tracker.phase(name)? == BootstrapPhase::Integrated {
            return Ok(PhaseTransition::AlreadyIntegrated);
        }

        let check = self.monitor.check_now(secrets_health).await;
        if !check.ready {
            return Err(StackupError::Precondition(format!(
                "secrets manager '{}' is not healthy: {}",
                secrets_health.target,
                check.diagnostic.unwrap_or_else(|| "not ready".into())
            )));
        }

        let current = substrate
            .driver
            .current_config()
            .await
            .map_err(|e| integration_failed(name, format!("reading current config: {e}")))?;
        let snapshot = self
            .snapshots
            .take(name, run_seq, SnapshotReason::PhaseTransition, &current)?;

        let Some(model) = &substrate.substrate_config else {
            return Err(integration_failed(name, "no substrate configuration model"));
        };
        let rendered = model
            .render(Some(integration))
            .map_err(|e| integration_failed(name, format!("integrated config rejected before apply: {e}")))?;

        info!(component = name, endpoint = %integration.address, "enabling secrets integration");
        if let Err(e) = substrate.driver.apply_config(&rendered).await {
            self.rollback
                .restore(name, substrate.driver.as_ref(), &snapshot)
                .await?;
            return Err(integration_failed(name, format!("apply: {e}")));
        }

        match self.monitor.wait_ready(&substrate.health, cancel).await {
            Readiness::Ready { attempts, elapsed } => {
                self.tracker
                    .set_phase(name, BootstrapPhase::Integrated, run_seq)?;
                self.snapshots.discard(name)?;
                info!(
                    component = name,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "substrate integrated with secrets manager"
                );
                Ok(PhaseTransition::Integrated)
            }
            Readiness::TimedOut { last_error, .. } => {
                warn!(component = name, "substrate unhealthy after integration; restoring snapshot");
                self.rollback
                    .restore(name, substrate.driver.as_ref(), &snapshot)
                    .await?;
                Err(integration_failed(
                    name,
                    format!(
                        "substrate not healthy after reload: {}",
                        last_error.unwrap_or_else(|| "no diagnostic".into())
                    ),
                ))
            }
            Readiness::Cancelled { .. } => {
                self.rollback
                    .restore(name, substrate.driver.as_ref(), &snapshot)
                    .await?;
                Err(StackupError::Cancelled)
            }
        }
    }
}

fn integration_failed(component: &str, diagnostic: impl Into<String>) -> StackupError {
    StackupError::IntegrationFailed {
        component: component.to_string(),
        diagnostic: diagnostic.into(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ComponentDriver, ConfigBlob, DriverResult, DriverState};
    use crate::health::{FnProbe, ProbeOutcome, ReadinessProbe};
    use crate::template::SubstrateConfig;
    use crate::types::{ComponentKind, Environment};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Keeps the active config in memory and logs every `apply_config`.
    struct MemDriver {
        active: Mutex<ConfigBlob>,
        applied: Mutex<Vec<ConfigBlob>>,
    }

    impl MemDriver {
        fn new(active: &str) -> Self {
            Self {
                active: Mutex::new(ConfigBlob::from(active)),
                applied: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ComponentDriver for MemDriver {
        async fn deploy(&self, config: &ConfigBlob) -> DriverResult {
            *self.active.lock().unwrap() = config.clone();
            Ok(())
        }
        async fn status(&self) -> DriverResult<DriverState> {
            Ok(DriverState::Running)
        }
        async fn stop(&self) -> DriverResult {
            Ok(())
        }
        async fn current_config(&self) -> DriverResult<ConfigBlob> {
            Ok(self.active.lock().unwrap().clone())
        }
        async fn apply_config(&self, config: &ConfigBlob) -> DriverResult {
            *self.active.lock().unwrap() = config.clone();
            self.applied.lock().unwrap().push(config.clone());
            Ok(())
        }
    }

    fn descriptor(target: &str, healthy: Arc<AtomicBool>) -> HealthCheckDescriptor {
        let probe: Arc<dyn ReadinessProbe> = Arc::new(FnProbe::new(target, move || {
            if healthy.load(Ordering::SeqCst) {
                ProbeOutcome::ready()
            } else {
                ProbeOutcome::not_ready("connection refused")
            }
        }));
        HealthCheckDescriptor::new(target, probe, Duration::from_secs(1), Duration::from_secs(5))
            .unwrap()
    }

    struct Fixture {
        _dir: TempDir,
        tracker: Arc<StateTracker>,
        snapshots: Arc<SnapshotStore>,
        ctl: PhaseController,
        driver: Arc<MemDriver>,
        substrate: ComponentSpec,
        secrets_ok: Arc<AtomicBool>,
        substrate_ok: Arc<AtomicBool>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let tracker = Arc::new(StateTracker::open_in(dir.path()).unwrap());
        let snapshots = Arc::new(SnapshotStore::open(dir.path()).unwrap());
        let ctl = PhaseController::new(tracker.clone(), snapshots.clone());
        let pre = SubstrateConfig::default().render(None).unwrap();
        let driver = Arc::new(MemDriver::new(&pre.as_text()));
        let substrate_ok = Arc::new(AtomicBool::new(true));
        let substrate = ComponentSpec::new(
            "nomad",
            ComponentKind::Substrate,
            0,
            driver.clone(),
            descriptor("nomad", substrate_ok.clone()),
        )
        .two_phase(SubstrateConfig::default());
        Fixture {
            _dir: dir,
            tracker,
            snapshots,
            ctl,
            driver,
            substrate,
            secrets_ok: Arc::new(AtomicBool::new(true)),
            substrate_ok,
        }
    }

    async fn enable(f: &Fixture) -> Result<PhaseTransition> {
        f.ctl
            .enable_integration(
                1,
                &f.substrate,
                &descriptor("vault", f.secrets_ok.clone()),
                &SecretsIntegration::new("http://127.0.0.1:8200"),
                &CancellationToken::new(),
            )
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_switch_reaches_integrated() {
        let f = fixture();
        assert_eq!(enable(&f).await.unwrap(), PhaseTransition::Integrated);
        assert_eq!(f.ctl.phase("nomad").unwrap(), BootstrapPhase::Integrated);
        let active = f.driver.active.lock().unwrap().as_text().into_owned();
        assert!(active.contains("create_from_role"));
        assert!(f.snapshots.latest("nomad").unwrap().is_none(), "snapshot discarded");
    }

    #[tokio::test(start_paused = true)]
    async fn second_call_is_a_noop() {
        let f = fixture();
        enable(&f).await.unwrap();
        f.secrets_ok.store(false, Ordering::SeqCst);
        assert_eq!(enable(&f).await.unwrap(), PhaseTransition::AlreadyIntegrated);
        assert_eq!(f.driver.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_secrets_manager_is_a_precondition_error() {
        let f = fixture();
        f.secrets_ok.store(false, Ordering::SeqCst);
        let err = enable(&f).await.unwrap_err();
        assert!(matches!(err, StackupError::Precondition(_)), "{err}");
        assert!(f.driver.applied.lock().unwrap().is_empty());
        assert_eq!(f.ctl.phase("nomad").unwrap(), BootstrapPhase::PreIntegration);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_substrate_restores_exact_snapshot() {
        let f = fixture();
        let before = f.driver.active.lock().unwrap().clone();
        f.substrate_ok.store(false, Ordering::SeqCst);

        let err = enable(&f).await.unwrap_err();
        assert!(matches!(err, StackupError::IntegrationFailed { .. }), "{err}");

        let applied = f.driver.applied.lock().unwrap().clone();
        assert_eq!(applied.len(), 2, "integrated config, then the snapshot");
        assert_eq!(applied[1], before);
        assert_eq!(f.ctl.phase("nomad").unwrap(), BootstrapPhase::PreIntegration);
        assert_eq!(f.snapshots.latest("nomad").unwrap().unwrap().content, before);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_integration_is_rejected_before_apply() {
        let f = fixture();
        let mut bad = SecretsIntegration::new("vault.local:8200");
        bad.policies = vec!["nomad server".into()];
        let err = f
            .ctl
            .enable_integration(
                1,
                &f.substrate,
                &descriptor("vault", f.secrets_ok.clone()),
                &bad,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StackupError::IntegrationFailed { .. }));
        assert!(f.driver.applied.lock().unwrap().is_empty());
        assert_eq!(f.ctl.phase("nomad").unwrap(), BootstrapPhase::PreIntegration);
    }

    #[tokio::test(start_paused = true)]
    async fn phase_survives_in_tracker() {
        let f = fixture();
        let _run = f.tracker.begin_run(Environment::Develop).unwrap();
        enable(&f).await.unwrap();
        let rec = f.tracker.phase_record("nomad").unwrap().unwrap();
        assert_eq!(rec.phase, BootstrapPhase::Integrated);
        assert_eq!(rec.run_seq, 1);
    }
}
