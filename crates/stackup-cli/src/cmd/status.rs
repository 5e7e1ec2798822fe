use crate::output::{print_json, print_table, truncate};
use anyhow::Context;
use serde::Serialize;
use stackup_core::{
    config::StackConfig,
    tracker::{PhaseRecord, StateTracker, StatusRecord},
    types::{ComponentKind, DeploymentStatus},
};
use std::path::Path;

#[derive(Serialize)]
struct ComponentStatus<'a> {
    name: &'a str,
    kind: ComponentKind,
    rank: u32,
    /// `None` when the component has never been part of a run.
    status: Option<DeploymentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest: Option<StatusRecord>,
}

#[derive(Serialize)]
struct StatusOutput<'a> {
    components: Vec<ComponentStatus<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<PhaseRecord>,
}

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = StackConfig::load(root).context("failed to load stack.yaml")?;
    let tracker = StateTracker::open_in(root).context("failed to open state database")?;

    let mut components = Vec::with_capacity(config.components.len());
    for c in &config.components {
        let latest = tracker.get(&c.name)?;
        components.push(ComponentStatus {
            name: &c.name,
            kind: c.kind,
            rank: c.rank,
            status: latest.as_ref().map(|r| r.status),
            latest,
        });
    }
    components.sort_by_key(|c| c.rank);

    let phase = match config
        .components
        .iter()
        .find(|c| c.kind == ComponentKind::Substrate)
    {
        Some(s) => tracker.phase_record(&s.name)?,
        None => None,
    };

    let out = StatusOutput { components, phase };
    if json {
        return print_json(&out);
    }

    let rows: Vec<Vec<String>> = out
        .components
        .iter()
        .map(|c| match &c.latest {
            Some(r) => vec![
                c.name.to_string(),
                c.kind.to_string(),
                r.status.to_string(),
                r.run_seq.to_string(),
                r.recorded_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                truncate(r.message.as_deref().unwrap_or(""), 60),
            ],
            None => vec![
                c.name.to_string(),
                c.kind.to_string(),
                "-".into(),
                "-".into(),
                "-".into(),
                "never deployed".into(),
            ],
        })
        .collect();
    print_table(&["COMPONENT", "KIND", "STATUS", "RUN", "UPDATED", "NOTE"], &rows);

    match &out.phase {
        Some(p) => println!("\nbootstrap phase: {} (since run {})", p.phase, p.run_seq),
        None if config.components.iter().any(|c| c.kind == ComponentKind::Substrate) => {
            println!("\nbootstrap phase: {}", stackup_core::types::BootstrapPhase::default())
        }
        None => {}
    }
    Ok(())
}
