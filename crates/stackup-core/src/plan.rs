//! Immutable run inputs: the components to bring up, in what order, and the
//! run-level switches. Everything here is validated once at construction so
//! the orchestrator never has to handle an unknown name mid-run.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::driver::{ComponentDriver, ConfigBlob};
use crate::error::{Result, StackupError};
use crate::health::HealthCheckDescriptor;
use crate::paths;
use crate::prereq::Prerequisites;
use crate::template::{SecretsIntegration, SubstrateConfig};
use crate::tracker::RunRecord;
use crate::types::{ComponentKind, Environment};

// ---------------------------------------------------------------------------
// ComponentSpec
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ComponentSpec {
    pub name: String,
    pub kind: ComponentKind,
    pub rank: u32,
    pub depends_on: Vec<String>,
    /// A soft component records `Failed` without aborting the run.
    pub soft: bool,
    /// Participates in the two-phase secrets bootstrap. Only valid for the
    /// substrate, which must then carry a typed `substrate_config`.
    pub two_phase: bool,
    pub driver: Arc<dyn ComponentDriver>,
    pub health: HealthCheckDescriptor,
    /// Handed to `deploy` for components without a typed model.
    pub initial_config: ConfigBlob,
    pub substrate_config: Option<SubstrateConfig>,
    /// Extra attempts after the first failure (0 = no retry).
    pub max_retries: u32,
    /// The file this component's driver writes; used to keep drivers apart.
    pub config_path: Option<PathBuf>,
    pub version: Option<String>,
}

impl ComponentSpec {
    pub fn new(
        name: impl Into<String>,
        kind: ComponentKind,
        rank: u32,
        driver: Arc<dyn ComponentDriver>,
        health: HealthCheckDescriptor,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            rank,
            depends_on: Vec::new(),
            soft: false,
            two_phase: false,
            driver,
            health,
            initial_config: ConfigBlob::default(),
            substrate_config: None,
            max_retries: 0,
            config_path: None,
            version: None,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn soft(mut self) -> Self {
        self.soft = true;
        self
    }

    pub fn two_phase(mut self, model: SubstrateConfig) -> Self {
        self.two_phase = true;
        self.substrate_config = Some(model);
        self
    }

    pub fn with_config(mut self, config: impl Into<ConfigBlob>) -> Self {
        self.initial_config = config.into();
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn owns_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }
}

impl std::fmt::Debug for ComponentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("rank", &self.rank)
            .field("depends_on", &self.depends_on)
            .field("soft", &self.soft)
            .field("two_phase", &self.two_phase)
            .field("health", &self.health)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RunOptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunOptions {
    pub environment: Environment,
    pub dry_run: bool,
    /// Redeploy components that already succeeded in an earlier run.
    pub force: bool,
    pub auto_approve: bool,
    /// Deploy independent components of a stage concurrently.
    pub parallel: bool,
    /// Which components may run concurrently. `None` means every component;
    /// plans built from `stack.yaml` always carry the declared set.
    pub parallel_eligible: Option<BTreeSet<String>>,
    /// Keep going after a hard failure; dependents of the failure are still
    /// skipped.
    pub continue_on_error: bool,
    /// Restrict the run to these components. Empty means all.
    pub only: BTreeSet<String>,
    pub skip: BTreeSet<String>,
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn selects(&self, name: &str) -> bool {
        self.only.is_empty() || self.only.contains(name)
    }

    pub fn runs_in_parallel(&self, name: &str) -> bool {
        self.parallel
            && self
                .parallel_eligible
                .as_ref()
                .map_or(true, |eligible| eligible.contains(name))
    }
}

// ---------------------------------------------------------------------------
// DeploymentPlan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    components: Vec<ComponentSpec>,
    options: RunOptions,
    secrets: Option<SecretsIntegration>,
    prerequisites: Prerequisites,
}

impl DeploymentPlan {
    /// Validate and freeze a plan. Components are ordered by rank, keeping
    /// declaration order within a rank.
    pub fn new(
        mut components: Vec<ComponentSpec>,
        options: RunOptions,
        secrets: Option<SecretsIntegration>,
    ) -> Result<Self> {
        components.sort_by_key(|c| c.rank);
        let plan = Self {
            components,
            options,
            secrets,
            prerequisites: Prerequisites::default(),
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn with_prerequisites(mut self, prerequisites: Prerequisites) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn components(&self) -> &[ComponentSpec] {
        &self.components
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn secrets(&self) -> Option<&SecretsIntegration> {
        self.secrets.as_ref()
    }

    pub fn prerequisites(&self) -> &Prerequisites {
        &self.prerequisites
    }

    pub fn get(&self, name: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|c| c.name == name)
    }

    /// The substrate taking part in the two-phase bootstrap, if any.
    pub fn two_phase_substrate(&self) -> Option<&ComponentSpec> {
        self.components.iter().find(|c| c.two_phase)
    }

    pub fn secrets_manager(&self) -> Option<&ComponentSpec> {
        self.components
            .iter()
            .find(|c| c.kind == ComponentKind::SecretsManager)
    }

    /// Components grouped by rank, lowest first.
    pub fn stages(&self) -> Vec<Vec<&ComponentSpec>> {
        let mut stages: Vec<Vec<&ComponentSpec>> = Vec::new();
        for c in &self.components {
            match stages.last_mut() {
                Some(stage) if stage[0].rank == c.rank => stage.push(c),
                _ => stages.push(vec![c]),
            }
        }
        stages
    }

    fn validate(&self) -> Result<()> {
        if self.components.is_empty() {
            return Err(StackupError::InvalidPlan("no components declared".into()));
        }

        let mut ranks: HashMap<&str, u32> = HashMap::new();
        for c in &self.components {
            paths::validate_name(&c.name)?;
            if ranks.insert(c.name.as_str(), c.rank).is_some() {
                return Err(StackupError::InvalidPlan(format!(
                    "component '{}' declared twice",
                    c.name
                )));
            }
        }

        for c in &self.components {
            for dep in &c.depends_on {
                let Some(dep_rank) = ranks.get(dep.as_str()) else {
                    return Err(StackupError::InvalidPlan(format!(
                        "'{}' depends on unknown component '{dep}'",
                        c.name
                    )));
                };
                if *dep_rank >= c.rank {
                    return Err(StackupError::InvalidPlan(format!(
                        "'{}' (rank {}) depends on '{dep}' (rank {dep_rank}); dependencies must have a lower rank",
                        c.name, c.rank
                    )));
                }
            }
        }

        for kind in [ComponentKind::Substrate, ComponentKind::SecretsManager] {
            let n = self.components.iter().filter(|c| c.kind == kind).count();
            if n > 1 {
                return Err(StackupError::InvalidPlan(format!(
                    "at most one {kind} component is allowed, found {n}"
                )));
            }
        }

        for c in self.components.iter().filter(|c| c.two_phase) {
            if c.kind != ComponentKind::Substrate {
                return Err(StackupError::InvalidPlan(format!(
                    "'{}' is {} but only the substrate takes part in the two-phase bootstrap",
                    c.name, c.kind
                )));
            }
            let Some(model) = &c.substrate_config else {
                return Err(StackupError::InvalidPlan(format!(
                    "two-phase component '{}' has no substrate configuration",
                    c.name
                )));
            };
            model.validate()?;
            if self.secrets_manager().is_none() {
                return Err(StackupError::InvalidPlan(
                    "two-phase bootstrap requires a secrets_manager component".into(),
                ));
            }
            match &self.secrets {
                Some(s) => s.validate()?,
                None => {
                    return Err(StackupError::InvalidPlan(
                        "two-phase bootstrap requires a secrets integration block".into(),
                    ))
                }
            }
        }

        let mut owners: HashMap<&PathBuf, &str> = HashMap::new();
        for c in &self.components {
            if let Some(path) = &c.config_path {
                if let Some(other) = owners.insert(path, c.name.as_str()) {
                    return Err(StackupError::InvalidPlan(format!(
                        "'{}' and '{other}' both write {}",
                        c.name,
                        path.display()
                    )));
                }
            }
        }

        for name in self
            .options
            .only
            .iter()
            .chain(&self.options.skip)
            .chain(self.options.parallel_eligible.iter().flatten())
        {
            if !ranks.contains_key(name.as_str()) {
                return Err(StackupError::ComponentNotFound(name.clone()));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Run-wide state threaded through every orchestrator call.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub record: RunRecord,
    pub options: RunOptions,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(record: RunRecord, options: RunOptions, cancel: CancellationToken) -> Self {
        Self {
            record,
            options,
            cancel,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.record.run_id
    }

    pub fn run_seq(&self) -> u64 {
        self.record.run_seq
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.record.started_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
