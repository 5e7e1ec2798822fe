//! Stage-by-stage bring-up of a [`DeploymentPlan`].
//!
//! Per component: skip if it already succeeded (unless forced), otherwise
//! `Running` → snapshot → `deploy` → health gate → `Succeeded`, or `Failed`
//! followed by a rollback and, when retries remain, `Failed → Pending` and
//! another attempt. After the stage holding the secrets manager the phase
//! controller switches the substrate over. A hard failure skips everything
//! after it unless `continue_on_error` is set; a soft failure is only
//! reported.
//!
//! All status changes go through the [`StateTracker`]; the orchestrator never
//! keeps its own copy of persisted state.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::driver::ConfigBlob;
use crate::error::{Result, StackupError};
use crate::health::{HealthMonitor, Readiness};
use crate::phase::{PhaseController, PhaseTransition};
use crate::plan::{ComponentSpec, DeploymentPlan, RunContext};
use crate::report::{ComponentReport, DeploymentReport};
use crate::rollback::RollbackController;
use crate::snapshot::{SnapshotReason, SnapshotStore};
use crate::template::SecretsIntegration;
use crate::tracker::StateTracker;
use crate::types::{BootstrapPhase, DeploymentStatus};

/// What one component's deploy produced.
#[derive(Debug)]
struct ComponentOutcome {
    report: ComponentReport,
    /// Set when the component's failure must abort the whole run.
    fatal: Option<StackupError>,
}

/// Mutable bookkeeping for a single run.
struct RunState {
    outcomes: HashMap<String, ComponentReport>,
    /// Failed components plus everything skipped because of them.
    blocked: HashSet<String>,
    abort: Option<String>,
    report: DeploymentReport,
}

impl RunState {
    fn absorb(&mut self, outcome: ComponentOutcome, continue_on_error: bool) {
        let rep = outcome.report;
        if rep.status == DeploymentStatus::Failed {
            let diag = rep.message.clone().unwrap_or_else(|| "failed".into());
            if rep.soft {
                self.report
                    .warnings
                    .push(format!("soft component '{}' failed: {diag}", rep.name));
            } else {
                self.blocked.insert(rep.name.clone());
                if !continue_on_error && self.abort.is_none() {
                    self.abort = Some(format!("'{}' failed", rep.name));
                }
            }
        }
        if let Some(err) = outcome.fatal {
            self.fail_fatally(err);
        }
        self.outcomes.insert(rep.name.clone(), rep);
    }

    fn fail_fatally(&mut self, err: StackupError) {
        error!(error = %err, "aborting run");
        if self.report.fatal.is_none() {
            self.report.fatal_exit_code = Some(err.exit_code());
            self.report.fatal = Some(err.to_string());
        }
        self.abort.get_or_insert_with(|| err.to_string());
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    tracker: Arc<StateTracker>,
    snapshots: Arc<SnapshotStore>,
    monitor: HealthMonitor,
    rollback: RollbackController,
    phase: PhaseController,
}

impl Orchestrator {
    pub fn new(tracker: Arc<StateTracker>, snapshots: Arc<SnapshotStore>) -> Self {
        Self {
            monitor: HealthMonitor::new(),
            rollback: RollbackController::new(snapshots.clone()),
            phase: PhaseController::new(tracker.clone(), snapshots.clone()),
            tracker,
            snapshots,
        }
    }

    /// Open the state database and snapshot store under `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let tracker = Arc::new(StateTracker::open_in(root)?);
        let snapshots = Arc::new(SnapshotStore::open(root)?);
        Ok(Self::new(tracker, snapshots))
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn rollback(&self) -> &RollbackController {
        &self.rollback
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Execute `plan`. Returns `Err` only when nothing was touched
    /// (prerequisites) or persisted state could not be written; every other
    /// failure is described in the report.
    pub async fn run(
        &self,
        plan: &DeploymentPlan,
        cancel: CancellationToken,
    ) -> Result<DeploymentReport> {
        let started = Instant::now();
        let opts = plan.options();
        let mut report = DeploymentReport::new(opts.environment, opts.dry_run, Utc::now());
        report.stages = plan
            .stages()
            .iter()
            .map(|s| s.iter().map(|c| c.name.clone()).collect())
            .collect();

        if opts.dry_run {
            return self.preview(plan, report, started);
        }

        plan.prerequisites().check().await?;

        let record = self.tracker.begin_run(opts.environment)?;
        let ctx = RunContext::new(record, opts.clone(), cancel.child_token());
        let timer = opts.timeout.map(|limit| {
            let token = ctx.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(timeout_secs = limit.as_secs(), "run timeout reached, cancelling");
                token.cancel();
            })
        });

        report.run_id = Some(ctx.run_id());
        report.run_seq = Some(ctx.run_seq());
        info!(
            run_seq = ctx.run_seq(),
            run_id = %ctx.run_id(),
            environment = %opts.environment,
            components = plan.components().len(),
            "deployment run started"
        );

        for c in plan.components() {
            self.tracker.record(&ctx.record, &c.name, DeploymentStatus::Pending, None)?;
        }

        let mut state = RunState {
            outcomes: HashMap::new(),
            blocked: HashSet::new(),
            abort: None,
            report,
        };

        let result = self.run_stages(&ctx, plan, &mut state).await;
        if let Some(t) = timer {
            t.abort();
        }
        result?;

        let mut report = state.report;
        if ctx.is_cancelled() {
            report.warnings.push("run cancelled".into());
            if report.fatal.is_none() {
                report.fatal = Some(StackupError::Cancelled.to_string());
                report.fatal_exit_code = Some(StackupError::Cancelled.exit_code());
            }
        }
        report.components = plan
            .components()
            .iter()
            .filter_map(|c| state.outcomes.remove(&c.name))
            .collect();
        if let Some(s) = plan.two_phase_substrate() {
            report.phase = Some(self.tracker.phase(&s.name)?);
        }
        report.finalize(started.elapsed());
        self.tracker.finish_run(ctx.run_seq(), report.exit_code)?;

        info!(
            run_seq = ctx.run_seq(),
            succeeded = report.count(DeploymentStatus::Succeeded),
            failed = report.count(DeploymentStatus::Failed),
            skipped = report.count(DeploymentStatus::Skipped),
            exit_code = report.exit_code,
            "deployment run finished"
        );
        Ok(report)
    }

    async fn run_stages(
        &self,
        ctx: &RunContext,
        plan: &DeploymentPlan,
        state: &mut RunState,
    ) -> Result<()> {
        let continue_on_error = ctx.options.continue_on_error;

        for (index, stage) in plan.stages().into_iter().enumerate() {
            debug!(stage = index, components = stage.len(), "entering stage");

            let mut concurrent = Vec::new();
            let mut serial = Vec::new();
            for spec in &stage {
                if let Some(reason) = self.skip_reason(ctx, spec, state)? {
                    let outcome = self.skip(ctx, spec, reason)?;
                    state.absorb(outcome, continue_on_error);
                } else if ctx.options.runs_in_parallel(&spec.name) {
                    concurrent.push(*spec);
                } else {
                    serial.push(*spec);
                }
            }

            if concurrent.len() == 1 {
                serial.insert(0, concurrent.remove(0));
            }

            if !concurrent.is_empty() {
                for outcome in self.deploy_concurrently(ctx, plan, &concurrent).await? {
                    state.absorb(outcome, continue_on_error);
                }
            }

            for spec in serial {
                // A hard failure earlier in this stage stops the rest of it.
                if let Some(reason) = self.skip_reason(ctx, spec, state)? {
                    let outcome = self.skip(ctx, spec, reason)?;
                    state.absorb(outcome, continue_on_error);
                    continue;
                }
                let outcome = match self.config_for(spec, plan.secrets()) {
                    Ok(config) => self.deploy_component(ctx, spec, config).await?,
                    Err(e) => self.fail_before_deploy(ctx, spec, e)?,
                };
                state.absorb(outcome, continue_on_error);
            }

            // Gated on the secrets manager's own outcome, not on `abort`.
            if !ctx.is_cancelled() {
                if let Err(e) = self.integrate_after_stage(ctx, plan, &stage, state).await {
                    match e {
                        StackupError::Cancelled => state
                            .report
                            .warnings
                            .push("secrets integration interrupted; previous substrate config restored".into()),
                        StackupError::StateDb(_) => return Err(e),
                        other => state.fail_fatally(other),
                    }
                }
            }
        }
        Ok(())
    }

    /// Run `specs` as independent tasks and wait for every one of them.
    async fn deploy_concurrently(
        &self,
        ctx: &RunContext,
        plan: &DeploymentPlan,
        specs: &[&ComponentSpec],
    ) -> Result<Vec<ComponentOutcome>> {
        let mut outcomes = Vec::new();
        let mut handles = Vec::new();
        for spec in specs {
            match self.config_for(spec, plan.secrets()) {
                Ok(config) => {
                    let this = self.clone();
                    let ctx = ctx.clone();
                    let owned = (*spec).clone();
                    let task_spec = owned.clone();
                    let handle = tokio::spawn(async move {
                        this.deploy_component(&ctx, &task_spec, config).await
                    });
                    handles.push((owned, handle));
                }
                Err(e) => outcomes.push(self.fail_before_deploy(ctx, spec, e)?),
            }
        }

        let (specs, handles): (Vec<ComponentSpec>, Vec<_>) = handles.into_iter().unzip();
        let joined = futures::future::join_all(handles).await;
        for (spec, res) in specs.iter().zip(joined) {
            match res {
                Ok(outcome) => outcomes.push(outcome?),
                Err(e) => {
                    error!(component = %spec.name, error = %e, "deploy task aborted");
                    outcomes.push(self.fail_before_deploy(
                        ctx,
                        spec,
                        StackupError::Deploy {
                            component: spec.name.clone(),
                            diagnostic: format!("deploy task aborted: {e}"),
                        },
                    )?);
                }
            }
        }
        Ok(outcomes)
    }

    // -----------------------------------------------------------------------
    // Single component
    // -----------------------------------------------------------------------

    fn skip_reason(
        &self,
        ctx: &RunContext,
        spec: &ComponentSpec,
        state: &mut RunState,
    ) -> Result<Option<String>> {
        if let Some(reason) = &state.abort {
            return Ok(Some(format!("run aborted: {reason}")));
        }
        if ctx.is_cancelled() {
            return Ok(Some("cancelled before deploy".into()));
        }
        if !ctx.options.selects(&spec.name) {
            return Ok(Some("not selected".into()));
        }
        if ctx.options.skip.contains(&spec.name) {
            return Ok(Some("skipped by operator".into()));
        }
        if let Some(dep) = spec.depends_on.iter().find(|d| state.blocked.contains(*d)) {
            state.blocked.insert(spec.name.clone());
            return Ok(Some(format!("dependency '{dep}' failed")));
        }
        if !ctx.options.force {
            if let Some(prev) = self.tracker.last_settled(&spec.name)? {
                if prev.status == DeploymentStatus::Succeeded {
                    return Ok(Some(format!("already deployed in run {}", prev.run_seq)));
                }
            }
        }
        Ok(None)
    }

    fn skip(&self, ctx: &RunContext, spec: &ComponentSpec, reason: String) -> Result<ComponentOutcome> {
        info!(component = %spec.name, reason = %reason, "skipping");
        self.tracker
            .record(&ctx.record, &spec.name, DeploymentStatus::Skipped, Some(&reason))?;
        Ok(ComponentOutcome {
            report: ComponentReport::skipped(&spec.name, spec.kind, spec.rank, spec.soft, reason),
            fatal: None,
        })
    }

    /// The config handed to `deploy`. The substrate is rendered from its
    /// typed model, integrated when the persisted phase says so.
    fn config_for(
        &self,
        spec: &ComponentSpec,
        secrets: Option<&SecretsIntegration>,
    ) -> Result<ConfigBlob> {
        if !spec.two_phase {
            return Ok(spec.initial_config.clone());
        }
        let model = spec.substrate_config.as_ref().ok_or_else(|| {
            StackupError::InvalidPlan(format!("'{}' has no substrate configuration", spec.name))
        })?;
        let integrated = self.tracker.phase(&spec.name)? == BootstrapPhase::Integrated;
        model.render(if integrated { secrets } else { None })
    }

    /// Record a failure that happened before the driver was called.
    fn fail_before_deploy(
        &self,
        ctx: &RunContext,
        spec: &ComponentSpec,
        err: StackupError,
    ) -> Result<ComponentOutcome> {
        let message = err.to_string();
        error!(component = %spec.name, error = %message, "cannot deploy");
        self.tracker
            .record(&ctx.record, &spec.name, DeploymentStatus::Running, None)?;
        self.tracker
            .record(&ctx.record, &spec.name, DeploymentStatus::Failed, Some(&message))?;
        Ok(ComponentOutcome {
            report: ComponentReport {
                name: spec.name.clone(),
                kind: spec.kind,
                rank: spec.rank,
                soft: spec.soft,
                status: DeploymentStatus::Failed,
                message: Some(message),
                attempts: 0,
                elapsed: std::time::Duration::ZERO,
                rollback: None,
            },
            fatal: None,
        })
    }

    async fn deploy_component(
        &self,
        ctx: &RunContext,
        spec: &ComponentSpec,
        config: ConfigBlob,
    ) -> Result<ComponentOutcome> {
        let started = Instant::now();
        let name = spec.name.as_str();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if ctx.is_cancelled() {
                let reason = "cancelled before deploy".to_string();
                self.tracker
                    .record(&ctx.record, name, DeploymentStatus::Skipped, Some(&reason))?;
                let mut report =
                    ComponentReport::skipped(name, spec.kind, spec.rank, spec.soft, reason);
                report.attempts = attempt - 1;
                report.elapsed = started.elapsed();
                return Ok(ComponentOutcome { report, fatal: None });
            }

            self.tracker.record(
                &ctx.record,
                name,
                DeploymentStatus::Running,
                Some(&format!("attempt {attempt}")),
            )?;
            if attempt == 1 {
                self.snapshot_before_deploy(ctx, spec).await?;
            }

            info!(
                component = name,
                run_seq = ctx.run_seq(),
                attempt,
                version = spec.version.as_deref().unwrap_or("unpinned"),
                "deploying"
            );
            let failure = match spec.driver.deploy(&config).await {
                Err(e) => StackupError::Deploy {
                    component: name.to_string(),
                    diagnostic: e.diagnostic,
                }
                .to_string(),
                Ok(()) if ctx.is_cancelled() => "cancelled during deploy".to_string(),
                Ok(()) => match self.monitor.wait_ready(&spec.health, &ctx.cancel).await {
                    Readiness::Ready { attempts, elapsed } => {
                        let message = format!(
                            "healthy after {attempts} poll(s) in {}ms",
                            elapsed.as_millis()
                        );
                        self.tracker.record(
                            &ctx.record,
                            name,
                            DeploymentStatus::Succeeded,
                            Some(&message),
                        )?;
                        info!(component = name, attempt, polls = attempts, "component healthy");
                        return Ok(ComponentOutcome {
                            report: ComponentReport {
                                name: name.to_string(),
                                kind: spec.kind,
                                rank: spec.rank,
                                soft: spec.soft,
                                status: DeploymentStatus::Succeeded,
                                message: Some(message),
                                attempts: attempt,
                                elapsed: started.elapsed(),
                                rollback: None,
                            },
                            fatal: None,
                        });
                    }
                    Readiness::TimedOut { last_error, .. } => StackupError::HealthTimeout {
                        component: name.to_string(),
                        timeout_secs: spec.health.timeout.as_secs(),
                        last_error: last_error.unwrap_or_else(|| "no diagnostic".into()),
                    }
                    .to_string(),
                    Readiness::Cancelled { .. } => "cancelled while waiting for health".to_string(),
                },
            };

            warn!(component = name, attempt, error = %failure, "component failed");
            self.tracker
                .record(&ctx.record, name, DeploymentStatus::Failed, Some(&failure))?;

            let rollback = self
                .rollback
                .on_failure(name, spec.driver.as_ref(), DeploymentStatus::Failed)
                .await;
            info!(component = name, outcome = %rollback, "rollback finished");
            let fatal = rollback.clone().into_error(name);

            if fatal.is_none() && attempt <= spec.max_retries && !ctx.is_cancelled() {
                self.tracker.retry(
                    &ctx.record,
                    name,
                    &format!("retry {attempt}/{} after: {failure}", spec.max_retries),
                )?;
                continue;
            }

            return Ok(ComponentOutcome {
                report: ComponentReport {
                    name: name.to_string(),
                    kind: spec.kind,
                    rank: spec.rank,
                    soft: spec.soft,
                    status: DeploymentStatus::Failed,
                    message: Some(failure),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    rollback: Some(rollback),
                },
                fatal,
            });
        }
    }

    async fn snapshot_before_deploy(&self, ctx: &RunContext, spec: &ComponentSpec) -> Result<()> {
        match spec.driver.current_config().await {
            Ok(current) if !current.is_empty() => {
                self.snapshots
                    .take(&spec.name, ctx.run_seq(), SnapshotReason::PreDeploy, &current)?;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(component = %spec.name, error = %e, "could not read current config; no pre-deploy snapshot");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phase transition
    // -----------------------------------------------------------------------

    /// After the stage holding the secrets manager: switch the substrate to
    /// the secrets manager if both are in a good state and it has not been
    /// done yet.
    async fn integrate_after_stage(
        &self,
        ctx: &RunContext,
        plan: &DeploymentPlan,
        stage: &[&ComponentSpec],
        state: &mut RunState,
    ) -> Result<()> {
        let (Some(substrate), Some(secrets), Some(integration)) = (
            plan.two_phase_substrate(),
            plan.secrets_manager(),
            plan.secrets(),
        ) else {
            return Ok(());
        };
        if !stage.iter().any(|c| c.name == secrets.name) {
            return Ok(());
        }
        if self.tracker.phase(&substrate.name)? == BootstrapPhase::Integrated {
            return Ok(());
        }
        let secrets_status = state.outcomes.get(&secrets.name).map(|r| r.status);
        if state.blocked.contains(&substrate.name)
            || state.outcomes.get(&substrate.name).map(|r| r.status) == Some(DeploymentStatus::Failed)
        {
            if secrets_status == Some(DeploymentStatus::Succeeded) {
                let msg = format!(
                    "substrate '{}' failed; it stays {} until a later run",
                    substrate.name,
                    BootstrapPhase::PreIntegration
                );
                warn!(component = %substrate.name, "{msg}");
                state.report.warnings.push(msg);
            }
            return Ok(());
        }

        match secrets_status {
            Some(DeploymentStatus::Succeeded) => {}
            // Skipped because the run aborted: nothing says it is serving.
            Some(DeploymentStatus::Skipped) if state.abort.is_some() => return Ok(()),
            Some(DeploymentStatus::Skipped) => {
                // Deployed by an earlier run; only switch over if it is
                // actually serving right now.
                let deployed = self
                    .tracker
                    .last_settled(&secrets.name)?
                    .is_some_and(|r| r.status == DeploymentStatus::Succeeded);
                if !deployed {
                    return Ok(());
                }
                let readiness = self.monitor.wait_ready(&secrets.health, &ctx.cancel).await;
                if !readiness.is_ready() {
                    let msg = format!(
                        "secrets manager '{}' is not healthy; substrate stays {}",
                        secrets.name,
                        BootstrapPhase::PreIntegration
                    );
                    warn!(component = %substrate.name, "{msg}");
                    state.report.warnings.push(msg);
                    return Ok(());
                }
            }
            _ => return Ok(()),
        }

        match self
            .phase
            .enable_integration(ctx.run_seq(), substrate, &secrets.health, integration, &ctx.cancel)
            .await
        {
            Ok(PhaseTransition::Integrated) => {
                info!(component = %substrate.name, "bootstrap phase is now integrated");
                Ok(())
            }
            Ok(PhaseTransition::AlreadyIntegrated) => Ok(()),
            Err(e @ StackupError::IntegrationFailed { .. }) => {
                warn!(component = %substrate.name, error = %e, "secrets integration failed; will retry on next run");
                state.report.warnings.push(e.to_string());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Dry run
    // -----------------------------------------------------------------------

    fn preview(
        &self,
        plan: &DeploymentPlan,
        mut report: DeploymentReport,
        started: Instant,
    ) -> Result<DeploymentReport> {
        let opts = plan.options();
        for (index, stage) in plan.stages().into_iter().enumerate() {
            for spec in stage {
                let action = if !opts.selects(&spec.name) {
                    "not selected".to_string()
                } else if opts.skip.contains(&spec.name) {
                    "skipped by operator".to_string()
                } else if !opts.force
                    && self
                        .tracker
                        .last_settled(&spec.name)?
                        .is_some_and(|r| r.status == DeploymentStatus::Succeeded)
                {
                    "already deployed, would skip".to_string()
                } else {
                    format!("would deploy in stage {}", index + 1)
                };
                report.components.push(ComponentReport::skipped(
                    &spec.name,
                    spec.kind,
                    spec.rank,
                    spec.soft,
                    format!("dry run: {action}"),
                ));
            }
        }
        if let Some(s) = plan.two_phase_substrate() {
            report.phase = Some(self.tracker.phase(&s.name)?);
        }
        report.finalize(started.elapsed());
        Ok(report)
    }
}
