use thiserror::Error;

#[derive(Debug, Error)]
pub enum StackupError {
    #[error("not initialized: run 'stackup init'")]
    NotInitialized,

    #[error("prerequisite missing: {0}")]
    Prerequisite(String),

    #[error("deploy of '{component}' failed: {diagnostic}")]
    Deploy {
        component: String,
        diagnostic: String,
    },

    #[error("'{component}' did not become healthy within {timeout_secs}s: {last_error}")]
    HealthTimeout {
        component: String,
        timeout_secs: u64,
        last_error: String,
    },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("secrets integration failed for '{component}': {diagnostic}")]
    IntegrationFailed {
        component: String,
        diagnostic: String,
    },

    #[error("rollback of '{component}' failed, manual intervention required: {diagnostic}")]
    RollbackFailed {
        component: String,
        diagnostic: String,
    },

    #[error("component not found: {0}")]
    ComponentNotFound(String),

    #[error("invalid component name '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidComponentName(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("invalid health check for '{target}': {reason}")]
    InvalidDescriptor { target: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid status transition for '{component}' from {from} to {to}")]
    InvalidTransition {
        component: String,
        from: String,
        to: String,
    },

    #[error("out-of-order write for '{component}': run {attempted} is older than recorded run {latest}")]
    OutOfOrderWrite {
        component: String,
        attempted: u64,
        latest: u64,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("state database error: {0}")]
    StateDb(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StackupError {
    /// Process exit code for this error when it ends a command.
    ///
    /// `2` covers anything that stops a run before a component is touched
    /// (bad arguments, missing tools, ordering violations); everything else
    /// is a deployment failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StackupError::NotInitialized
            | StackupError::Prerequisite(_)
            | StackupError::Precondition(_)
            | StackupError::ComponentNotFound(_)
            | StackupError::InvalidComponentName(_)
            | StackupError::InvalidPlan(_)
            | StackupError::InvalidDescriptor { .. }
            | StackupError::InvalidConfig(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, StackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prerequisite_and_precondition_exit_two() {
        assert_eq!(StackupError::Prerequisite("nomad".into()).exit_code(), 2);
        assert_eq!(StackupError::Precondition("vault".into()).exit_code(), 2);
        assert_eq!(
            StackupError::Deploy {
                component: "gateway".into(),
                diagnostic: "boom".into()
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn rollback_failure_exits_one() {
        let rb = StackupError::RollbackFailed {
            component: "nomad".into(),
            diagnostic: "disk full".into(),
        };
        assert_eq!(rb.exit_code(), 1);
        assert!(rb.to_string().contains("disk full"));
    }
}
