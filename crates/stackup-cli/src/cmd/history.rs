use crate::output::{print_json, print_table};
use anyhow::Context;
use stackup_core::{
    config::StackConfig,
    tracker::{StateTracker, StatusRecord},
    types::DeploymentStatus,
};
use std::path::Path;

pub fn run(root: &Path, limit: Option<usize>, json: bool) -> anyhow::Result<()> {
    // Refuse to create a state database in a directory that was never set up.
    StackConfig::load(root).context("failed to load stack.yaml")?;
    let tracker = StateTracker::open_in(root).context("failed to open state database")?;
    let mut runs = tracker.history()?;
    if let Some(n) = limit {
        let skip = runs.len().saturating_sub(n);
        runs.drain(..skip);
    }

    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    let count = |components: &[StatusRecord], status: DeploymentStatus| {
        components.iter().filter(|r| r.status == status).count().to_string()
    };
    let rows: Vec<Vec<String>> = runs
        .iter()
        .map(|s| {
            vec![
                s.run.run_seq.to_string(),
                s.run.environment.to_string(),
                s.run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                s.run
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "interrupted".into()),
                count(&s.components, DeploymentStatus::Succeeded),
                count(&s.components, DeploymentStatus::Failed),
                count(&s.components, DeploymentStatus::Skipped),
            ]
        })
        .collect();
    print_table(
        &["RUN", "ENV", "STARTED", "EXIT", "SUCCEEDED", "FAILED", "SKIPPED"],
        &rows,
    );
    Ok(())
}
