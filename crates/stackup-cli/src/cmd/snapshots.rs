use crate::output::print_json;
use anyhow::Context;
use stackup_core::snapshot::SnapshotStore;
use std::path::Path;

pub fn prune(root: &Path, component: Option<&str>, json: bool) -> anyhow::Result<()> {
    let store = SnapshotStore::open(root).context("failed to open snapshot store")?;
    let removed = store.prune(component)?;

    if json {
        print_json(&serde_json::json!({
            "component": component,
            "removed": removed,
        }))?;
    } else {
        match component {
            Some(c) => println!("Removed {removed} snapshot(s) of {c}"),
            None => println!("Removed {removed} snapshot(s)"),
        }
    }
    Ok(())
}
