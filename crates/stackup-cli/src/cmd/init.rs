use anyhow::Context;
use stackup_core::{config::StackConfig, io, paths};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing stackup in: {}", root.display());

    for dir in [paths::state_dir(root), paths::snapshots_dir(root)] {
        io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let created = StackConfig::default_stack()
        .save_if_missing(root)
        .context("failed to write stack.yaml")?;
    if created {
        println!("  created: {}", paths::STACK_FILE);
    } else {
        println!("  exists:  {}", paths::STACK_FILE);
    }

    println!("\nEdit the driver commands in stack.yaml, then run: stackup deploy --dry-run");
    Ok(())
}
