use crate::output::print_json;
use anyhow::Context;
use stackup_core::{config::StackConfig, orchestrator::Orchestrator, types::Environment};
use std::path::Path;

pub fn run(root: &Path, component: &str, env: Environment, json: bool) -> anyhow::Result<()> {
    let mut config = StackConfig::load(root).context("failed to load stack.yaml")?;
    config.apply_env(|key| std::env::var(key).ok());
    let target = config.component(component)?;
    let driver = config.driver_for(root, target, env);

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        let orchestrator = Orchestrator::open(root)?;
        Ok::<_, stackup_core::StackupError>(
            orchestrator.rollback().roll_back(component, driver.as_ref()).await,
        )
    })?;

    if json {
        #[derive(serde::Serialize)]
        struct RollbackOutput<'a> {
            component: &'a str,
            #[serde(flatten)]
            outcome: &'a stackup_core::rollback::RollbackOutcome,
        }
        print_json(&RollbackOutput {
            component,
            outcome: &outcome,
        })?;
    } else {
        println!("{component}: {outcome}");
    }

    match outcome.into_error(component) {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
