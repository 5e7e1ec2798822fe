use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::{ComponentDriver, DriverCommands, ScriptDriver};
use crate::error::{Result, StackupError};
use crate::health::{HealthCheckDescriptor, ProbeSpec};
use crate::paths;
use crate::plan::{ComponentSpec, DeploymentPlan, RunOptions};
use crate::prereq::Prerequisites;
use crate::template::{SecretsIntegration, SubstrateConfig};
use crate::types::{ComponentKind, Environment};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// HealthConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    /// Omitted: derived from the component kind and address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeSpec>,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    /// Upper bound for a single poll.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_interval() -> u64 {
    2
}

fn default_health_timeout() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe: None,
            interval_secs: default_interval(),
            timeout_secs: default_health_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentConfig {
    pub name: String,
    pub kind: ComponentKind,
    pub rank: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub soft: bool,
    /// May deploy alongside the rest of its stage under `--parallel`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// `host:port`. Omitted: the well-known port for the kind on localhost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Maximum number of retries after the first attempt.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub health: HealthConfig,
    pub driver: DriverCommands,
    /// Literal configuration handed to `deploy` for kinds without a typed
    /// model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

impl ComponentConfig {
    pub fn address(&self) -> String {
        self.address
            .clone()
            .unwrap_or_else(|| default_address(self.kind).to_string())
    }

    pub fn probe(&self, env: Environment) -> ProbeSpec {
        if let Some(p) = &self.health.probe {
            return p.clone();
        }
        let base = format!("{}://{}", env.scheme(), self.address());
        match self.kind {
            ComponentKind::ServiceCatalog | ComponentKind::Substrate => ProbeSpec::Leader {
                url: format!("{base}/v1/status/leader"),
                tls_skip_verify: false,
            },
            ComponentKind::SecretsManager => ProbeSpec::Http {
                url: format!("{base}/v1/sys/health"),
                tls_skip_verify: false,
            },
            ComponentKind::Gateway => ProbeSpec::Http {
                url: format!("{base}/ping"),
                tls_skip_verify: false,
            },
        }
    }
}

fn default_address(kind: ComponentKind) -> &'static str {
    match kind {
        ComponentKind::ServiceCatalog => "127.0.0.1:8500",
        ComponentKind::Substrate => "127.0.0.1:4646",
        ComponentKind::SecretsManager => "127.0.0.1:8200",
        ComponentKind::Gateway => "127.0.0.1:8080",
    }
}

// ---------------------------------------------------------------------------
// StackConfig (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub prerequisites: Prerequisites,
    #[serde(default)]
    pub substrate: SubstrateConfig,
    /// Integration block for the two-phase bootstrap. Omitted: defaults with
    /// the endpoint derived from the secrets manager component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<SecretsIntegration>,
    pub components: Vec<ComponentConfig>,
}

fn default_version() -> u32 {
    1
}

impl StackConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::stack_path(root);
        if !path.exists() {
            return Err(StackupError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: StackConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::stack_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Write this config unless a stack file already exists. Returns whether
    /// it was written.
    pub fn save_if_missing(&self, root: &Path) -> Result<bool> {
        let data = serde_yaml::to_string(self)?;
        crate::io::write_if_missing(&paths::stack_path(root), data.as_bytes())
    }

    pub fn component(&self, name: &str) -> Result<&ComponentConfig> {
        self.components
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| StackupError::ComponentNotFound(name.to_string()))
    }

    /// Apply `STACKUP_<NAME>_VERSION` and `STACKUP_<NAME>_ADDR` overrides.
    /// `lookup` is `std::env::var(..).ok()` outside of tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for c in &mut self.components {
            let stem = paths::env_stem(&c.name);
            if let Some(v) = lookup(&format!("STACKUP_{stem}_VERSION")).filter(|v| !v.is_empty()) {
                c.version = Some(v);
            }
            if let Some(a) = lookup(&format!("STACKUP_{stem}_ADDR")).filter(|a| !a.is_empty()) {
                c.address = Some(a);
            }
        }
    }

    fn has_kind(&self, kind: ComponentKind) -> bool {
        self.components.iter().any(|c| c.kind == kind)
    }

    /// The integration block with its endpoint resolved, when the stack has
    /// both a substrate and a secrets manager.
    pub fn secrets_integration(&self, env: Environment) -> Option<SecretsIntegration> {
        let secrets = self
            .components
            .iter()
            .find(|c| c.kind == ComponentKind::SecretsManager)?;
        if !self.has_kind(ComponentKind::Substrate) {
            return None;
        }
        let mut integration = self
            .secrets
            .clone()
            .unwrap_or_else(|| SecretsIntegration::new(String::new()));
        if integration.address.is_empty() {
            integration.address = format!("{}://{}", env.scheme(), secrets.address());
        }
        Some(integration)
    }

    /// Build the driver for one component.
    pub fn driver_for(
        &self,
        root: &Path,
        component: &ComponentConfig,
        env: Environment,
    ) -> Arc<dyn ComponentDriver> {
        let config_path = component
            .driver
            .config_path
            .clone()
            .map(|p| if p.is_absolute() { p } else { root.join(p) })
            .unwrap_or_else(|| paths::rendered_config_path(root, &component.name));
        let mut driver = ScriptDriver::new(
            &component.name,
            component.driver.clone(),
            config_path,
            root,
        )
        .with_env("STACKUP_ENV", env.as_str())
        .with_env("STACKUP_ADDR", component.address());
        if let Some(v) = &component.version {
            driver = driver.with_env("STACKUP_VERSION", v);
        }
        Arc::new(driver)
    }

    /// Turn the declared stack into a validated, frozen plan.
    pub fn build_plan(&self, root: &Path, mut options: RunOptions) -> Result<DeploymentPlan> {
        let env = options.environment;
        options.parallel_eligible = Some(
            self.components
                .iter()
                .filter(|c| c.parallel)
                .map(|c| c.name.clone())
                .collect(),
        );
        let integration = self.secrets_integration(env);
        let mut specs = Vec::with_capacity(self.components.len());

        for c in &self.components {
            paths::validate_name(&c.name)?;
            let h = &c.health;
            let probe = c
                .probe(env)
                .build(Duration::from_secs(h.request_timeout_secs.max(1)))?;
            let health = HealthCheckDescriptor::new(
                &c.name,
                probe,
                Duration::from_secs(h.interval_secs),
                Duration::from_secs(h.timeout_secs),
            )?;
            let driver = self.driver_for(root, c, env);
            let deps: Vec<&str> = c.depends_on.iter().map(String::as_str).collect();

            let mut spec = ComponentSpec::new(&c.name, c.kind, c.rank, driver, health)
                .depends_on(&deps)
                .with_retries(c.max_retries);
            spec.version = c.version.clone();
            if let Some(p) = &c.driver.config_path {
                spec = spec.owns_config(if p.is_absolute() { p.clone() } else { root.join(p) });
            }
            if c.soft {
                spec = spec.soft();
            }
            if c.kind == ComponentKind::Substrate {
                spec = if integration.is_some() {
                    spec.two_phase(self.substrate.clone())
                } else {
                    spec.with_config(self.substrate.render(None)?)
                };
            } else if let Some(text) = &c.config {
                spec = spec.with_config(text.as_str());
            }
            specs.push(spec);
        }

        Ok(DeploymentPlan::new(specs, options, integration)?
            .with_prerequisites(self.prerequisites.clone()))
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let names: Vec<&str> = self.components.iter().map(|c| c.name.as_str()).collect();

        for c in &self.components {
            if paths::validate_name(&c.name).is_err() {
                warnings.push(error(format!("invalid component name '{}'", c.name)));
            }
            if names.iter().filter(|n| **n == c.name).count() > 1 {
                warnings.push(error(format!("component '{}' declared more than once", c.name)));
            }
            for dep in &c.depends_on {
                if !names.contains(&dep.as_str()) {
                    warnings.push(error(format!(
                        "component '{}' depends on unknown component '{dep}'",
                        c.name
                    )));
                }
            }
            if c.driver.deploy.trim().is_empty() {
                warnings.push(error(format!("component '{}' has an empty deploy command", c.name)));
            }
            if c.driver.stop.trim().is_empty() {
                warnings.push(warning(format!(
                    "component '{}' has an empty stop command; rollback cannot stop it",
                    c.name
                )));
            }
            if c.health.interval_secs == 0 || c.health.timeout_secs <= c.health.interval_secs {
                warnings.push(error(format!(
                    "component '{}' health timeout ({}s) must exceed interval ({}s) and interval must be positive",
                    c.name, c.health.timeout_secs, c.health.interval_secs
                )));
            }
            if c.max_retries > 10 {
                warnings.push(warning(format!(
                    "component '{}' has max_retries={} (>10 is unusual)",
                    c.name, c.max_retries
                )));
            }
            if c.soft && matches!(c.kind, ComponentKind::Substrate | ComponentKind::SecretsManager) {
                warnings.push(warning(format!(
                    "component '{}' is {} but marked soft; dependents will run without it",
                    c.name, c.kind
                )));
            }
            if c.kind == ComponentKind::Substrate && c.config.is_some() {
                warnings.push(warning(format!(
                    "component '{}' sets config but the substrate is rendered from the substrate block",
                    c.name
                )));
            }
        }

        if let Err(e) = self.substrate.validate() {
            warnings.push(error(e.to_string()));
        }
        if let Some(s) = self.secrets_integration(Environment::Develop) {
            if let Err(e) = s.validate() {
                warnings.push(error(e.to_string()));
            }
        } else if self.secrets.is_some() {
            warnings.push(warning(
                "secrets block is ignored without both a substrate and a secrets_manager component",
            ));
        }

        warnings
    }

    // -----------------------------------------------------------------------
    // Default stack
    // -----------------------------------------------------------------------

    /// Catalog, scheduler, secrets manager and gateway on one host, driven
    /// through systemd and scheduler jobs.
    pub fn default_stack() -> Self {
        let systemd = |unit: &str, config_path: &str| DriverCommands {
            deploy: format!("systemctl enable --now {unit}"),
            stop: format!("systemctl stop {unit}"),
            status: Some(format!("systemctl is-active --quiet {unit}")),
            reload: Some(format!("systemctl reload {unit}")),
            config_path: Some(config_path.into()),
            timeout_secs: 600,
        };
        let job = |name: &str| DriverCommands {
            deploy: format!("nomad job run jobs/{name}.nomad.hcl"),
            stop: format!("nomad job stop {name}"),
            status: None,
            reload: None,
            config_path: None,
            timeout_secs: 600,
        };
        let component = |name: &str, kind, rank, deps: &[&str], driver| ComponentConfig {
            name: name.to_string(),
            kind,
            rank,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            soft: false,
            parallel: false,
            version: None,
            address: None,
            max_retries: 0,
            health: HealthConfig::default(),
            driver,
            config: None,
        };

        let mut consul = component(
            "consul",
            ComponentKind::ServiceCatalog,
            0,
            &[],
            systemd("consul", "/etc/consul.d/consul.hcl"),
        );
        consul.soft = true;
        consul.config = Some("server = true\nbootstrap_expect = 1\nui_config {\n  enabled = true\n}\n".into());

        let mut vault = component("vault", ComponentKind::SecretsManager, 2, &["nomad"], job("vault"));
        vault.health.timeout_secs = 120;

        Self {
            version: 1,
            prerequisites: Prerequisites {
                tools: vec!["systemctl".into(), "nomad".into()],
                network: Vec::new(),
                connect_timeout_secs: 3,
            },
            substrate: SubstrateConfig {
                catalog_address: Some("127.0.0.1:8500".into()),
                ..SubstrateConfig::default()
            },
            secrets: None,
            components: vec![
                consul,
                component(
                    "nomad",
                    ComponentKind::Substrate,
                    1,
                    &["consul"],
                    systemd("nomad", "/etc/nomad.d/nomad.hcl"),
                ),
                vault,
                component("traefik", ComponentKind::Gateway, 3, &["nomad"], job("traefik")),
            ],
        }
    }
}

fn warning(message: impl Into<String>) -> ConfigWarning {
    ConfigWarning {
        level: WarnLevel::Warning,
        message: message.into(),
    }
}

fn error(message: impl Into<String>) -> ConfigWarning {
    ConfigWarning {
        level: WarnLevel::Error,
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn default_stack_is_clean() {
        let cfg = StackConfig::default_stack();
        let warnings = cfg.validate();
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn default_stack_roundtrip() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".stackup")).unwrap();
        StackConfig::default_stack().save(dir.path()).unwrap();
        let cfg = StackConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.components.len(), 4);
        assert_eq!(cfg.components[0].kind, ComponentKind::ServiceCatalog);
        assert!(cfg.components[0].soft);
    }

    #[test]
    fn load_missing_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            StackConfig::load(dir.path()),
            Err(StackupError::NotInitialized)
        ));
    }

    #[test]
    fn minimal_yaml_uses_defaults() {
        let yaml = r#"
components:
  - name: vault
    kind: secrets_manager
    rank: 1
    driver:
      deploy: "nomad job run vault.hcl"
      stop: "nomad job stop vault"
"#;
        let cfg: StackConfig = serde_yaml::from_str(yaml).unwrap();
        let vault = cfg.component("vault").unwrap();
        assert_eq!(vault.health.interval_secs, 2);
        assert_eq!(vault.health.timeout_secs, 60);
        assert_eq!(vault.address(), "127.0.0.1:8200");
        assert_eq!(
            vault.probe(Environment::Production),
            ProbeSpec::Http {
                url: "https://127.0.0.1:8200/v1/sys/health".into(),
                tls_skip_verify: false
            }
        );
        assert_eq!(cfg.substrate, SubstrateConfig::default());
    }

    #[test]
    fn unknown_component_field_rejected() {
        let yaml = r#"
components:
  - name: vault
    kind: secrets_manager
    rank: 1
    replicas: 3
    driver: { deploy: "x", stop: "y" }
"#;
        assert!(serde_yaml::from_str::<StackConfig>(yaml).is_err());
    }

    #[test]
    fn unknown_kind_rejected() {
        let yaml = r#"
components:
  - name: db
    kind: database
    rank: 0
    driver: { deploy: "x", stop: "y" }
"#;
        assert!(serde_yaml::from_str::<StackConfig>(yaml).is_err());
    }

    #[test]
    fn env_overrides_version_and_address() {
        let mut cfg = StackConfig::default_stack();
        let vars: HashMap<String, String> = [
            ("STACKUP_VAULT_VERSION", "1.15.4"),
            ("STACKUP_NOMAD_ADDR", "10.0.0.5:4646"),
            ("STACKUP_TRAEFIK_ADDR", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        cfg.apply_env(|k| vars.get(k).cloned());
        assert_eq!(cfg.component("vault").unwrap().version.as_deref(), Some("1.15.4"));
        assert_eq!(cfg.component("nomad").unwrap().address(), "10.0.0.5:4646");
        assert_eq!(cfg.component("traefik").unwrap().address(), "127.0.0.1:8080");
    }

    #[test]
    fn secrets_endpoint_derived_from_component() {
        let cfg = StackConfig::default_stack();
        let s = cfg.secrets_integration(Environment::Staging).unwrap();
        assert_eq!(s.address, "https://127.0.0.1:8200");
        assert_eq!(s.create_from_role, "nomad-cluster");
    }

    #[test]
    fn validate_flags_bad_references_and_timing() {
        let mut cfg = StackConfig::default_stack();
        cfg.components[3].depends_on.push("consul-ui".into());
        cfg.components[2].health.timeout_secs = 1;
        cfg.components[2].health.interval_secs = 2;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("consul-ui")));
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("health timeout")));
    }

    #[test]
    fn build_plan_marks_substrate_two_phase() {
        let dir = TempDir::new().unwrap();
        let cfg = StackConfig::default_stack();
        let plan = cfg.build_plan(dir.path(), RunOptions::default()).unwrap();
        let nomad = plan.two_phase_substrate().unwrap();
        assert_eq!(nomad.name, "nomad");
        assert_eq!(
            nomad.config_path.as_deref(),
            Some(Path::new("/etc/nomad.d/nomad.hcl"))
        );
        assert_eq!(plan.secrets().unwrap().address, "http://127.0.0.1:8200");
        assert_eq!(plan.stages().len(), 4);
        assert!(plan.get("consul").unwrap().soft);
    }

    #[test]
    fn build_plan_takes_parallel_set_from_components() {
        let dir = TempDir::new().unwrap();
        let mut cfg = StackConfig::default_stack();
        cfg.components[3].parallel = true;
        let opts = RunOptions {
            parallel: true,
            ..Default::default()
        };
        let plan = cfg.build_plan(dir.path(), opts).unwrap();
        assert!(plan.options().runs_in_parallel("traefik"));
        assert!(!plan.options().runs_in_parallel("vault"));

        let yaml = serde_yaml::to_string(&cfg).unwrap();
        assert_eq!(yaml.matches("parallel: true").count(), 1);
    }

    #[test]
    fn substrate_without_secrets_manager_is_single_phase() {
        let dir = TempDir::new().unwrap();
        let mut cfg = StackConfig::default_stack();
        cfg.components.retain(|c| c.kind != ComponentKind::SecretsManager);
        let plan = cfg.build_plan(dir.path(), RunOptions::default()).unwrap();
        assert!(plan.two_phase_substrate().is_none());
        let nomad = plan.get("nomad").unwrap();
        assert!(nomad.initial_config.as_text().contains("enabled = false"));
    }
}
