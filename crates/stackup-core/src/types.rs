use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// DeploymentStatus
// ---------------------------------------------------------------------------

/// Outcome of the current run for one component.
///
/// Transitions: `Pending → Running → Succeeded | Failed`, `Pending → Skipped`,
/// and the explicit retry edge `Failed → Pending`. Nothing else regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl DeploymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Succeeded => "succeeded",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Skipped => "skipped",
        }
    }

    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// BootstrapPhase
// ---------------------------------------------------------------------------

/// Two-state lifecycle of the substrate's secrets integration.
///
/// `PreIntegration → Integrated`, once, after the secrets manager is healthy.
/// There is no automatic way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPhase {
    #[default]
    PreIntegration,
    Integrated,
}

impl BootstrapPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BootstrapPhase::PreIntegration => "pre_integration",
            BootstrapPhase::Integrated => "integrated",
        }
    }
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ComponentKind
// ---------------------------------------------------------------------------

/// The closed set of services this tool knows how to sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Service catalog the scheduler registers into; a base layer that
    /// downstream stages tolerate being briefly unavailable.
    ServiceCatalog,
    /// The workload scheduler every other service runs on.
    Substrate,
    /// Encrypted secret storage, itself scheduled by the substrate.
    SecretsManager,
    /// Edge router in front of scheduled workloads.
    Gateway,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::ServiceCatalog => "service_catalog",
            ComponentKind::Substrate => "substrate",
            ComponentKind::SecretsManager => "secrets_manager",
            ComponentKind::Gateway => "gateway",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Develop,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Develop => "develop",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    /// URL scheme used for default component addresses.
    pub fn scheme(self) -> &'static str {
        match self {
            Environment::Develop => "http",
            Environment::Staging | Environment::Production => "https",
        }
    }

    pub fn requires_approval(self) -> bool {
        self == Environment::Production
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = crate::error::StackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "develop" | "dev" => Ok(Environment::Develop),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(crate::error::StackupError::InvalidConfig(format!(
                "unknown environment '{s}' (expected develop, staging or production)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        use DeploymentStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Succeeded.can_transition_to(Pending));
        assert!(!Skipped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn environment_parse() {
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Develop);
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let yaml = serde_yaml::to_string(&ComponentKind::SecretsManager).unwrap();
        assert!(yaml.contains("secrets_manager"));
    }
}
