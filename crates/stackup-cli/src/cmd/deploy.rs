use crate::output::{print_json, print_table, truncate};
use anyhow::Context;
use clap::builder::FalseyValueParser;
use clap::Args;
use stackup_core::{
    config::{StackConfig, WarnLevel},
    orchestrator::Orchestrator,
    plan::RunOptions,
    report::DeploymentReport,
    types::{DeploymentStatus, Environment},
    StackupError,
};
use std::io::{BufRead, Write};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Args)]
pub struct DeployArgs {
    /// Target environment: develop, staging or production
    #[arg(long = "env", short = 'e', env = "STACKUP_ENV", default_value = "develop")]
    pub environment: Environment,

    /// Show what would be deployed without touching anything
    #[arg(long, env = "STACKUP_DRY_RUN", value_parser = FalseyValueParser::new())]
    pub dry_run: bool,

    /// Only deploy these components (comma-separated)
    #[arg(long, value_delimiter = ',', value_name = "NAMES")]
    pub components: Vec<String>,

    /// Skip a component (repeatable or comma-separated)
    #[arg(long, value_delimiter = ',', value_name = "NAME")]
    pub skip: Vec<String>,

    /// Redeploy components that already succeeded
    #[arg(long)]
    pub force: bool,

    /// Do not ask for confirmation before a production deploy
    #[arg(long, short = 'y', env = "STACKUP_AUTO_APPROVE", value_parser = FalseyValueParser::new())]
    pub auto_approve: bool,

    /// Deploy components marked `parallel` in stack.yaml concurrently within a stage
    #[arg(long)]
    pub parallel: bool,

    /// Keep going after a hard failure (dependents are still skipped)
    #[arg(long)]
    pub continue_on_error: bool,

    /// Cancel the run after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl DeployArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            environment: self.environment,
            dry_run: self.dry_run,
            force: self.force,
            auto_approve: self.auto_approve,
            parallel: self.parallel,
            continue_on_error: self.continue_on_error,
            only: self.components.iter().cloned().collect(),
            skip: self.skip.iter().cloned().collect(),
            timeout: self.timeout.map(Duration::from_secs),
            ..Default::default()
        }
    }
}

pub fn run(root: &Path, args: DeployArgs, json: bool) -> anyhow::Result<i32> {
    let mut config = StackConfig::load(root).context("failed to load stack.yaml")?;
    config.apply_env(|key| std::env::var(key).ok());

    let mut invalid = Vec::new();
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => eprintln!("warning: {}", w.message),
            WarnLevel::Error => invalid.push(w.message),
        }
    }
    if !invalid.is_empty() {
        return Err(StackupError::InvalidConfig(invalid.join("; ")).into());
    }

    let options = args.options();
    if options.environment.requires_approval() && !options.auto_approve && !options.dry_run {
        confirm(options.environment)?;
    }

    let plan = config
        .build_plan(root, options)
        .context("failed to build deployment plan")?;

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let orchestrator = Orchestrator::open(root)?;
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                on_signal.cancel();
            }
        });
        orchestrator.run(&plan, cancel).await
    })?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(report.exit_code)
}

fn confirm(env: Environment) -> anyhow::Result<()> {
    eprint!("Deploy to {env}? Type 'yes' to continue: ");
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    if matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
        Ok(())
    } else {
        Err(StackupError::Precondition(format!("deployment to {env} was not confirmed")).into())
    }
}

fn print_report(report: &DeploymentReport) {
    let title = if report.dry_run { "Dry run" } else { "Run" };
    match report.run_seq {
        Some(seq) => println!("{title} #{seq} ({})\n", report.environment),
        None => println!("{title} ({})\n", report.environment),
    }

    let rows: Vec<Vec<String>> = report
        .components
        .iter()
        .map(|c| {
            let mut note = c.message.clone().unwrap_or_default();
            if let Some(rb) = &c.rollback {
                note = format!("{note} [{rb}]");
            }
            vec![
                c.name.clone(),
                c.kind.to_string(),
                c.status.to_string(),
                c.attempts.to_string(),
                format!("{:.1}s", c.elapsed.as_secs_f64()),
                truncate(&note, 80),
            ]
        })
        .collect();
    print_table(
        &["COMPONENT", "KIND", "STATUS", "ATTEMPTS", "ELAPSED", "NOTE"],
        &rows,
    );

    if report.dry_run {
        println!();
        for (i, stage) in report.stages.iter().enumerate() {
            println!("stage {}: {}", i + 1, stage.join(", "));
        }
    }
    if let Some(phase) = report.phase {
        println!("\nbootstrap phase: {phase}");
    }
    for w in &report.warnings {
        println!("warning: {w}");
    }
    if let Some(fatal) = &report.fatal {
        println!("aborted: {fatal}");
    }

    println!(
        "\n{} succeeded, {} failed, {} skipped in {:.1}s",
        report.count(DeploymentStatus::Succeeded),
        report.count(DeploymentStatus::Failed),
        report.count(DeploymentStatus::Skipped),
        report.elapsed.as_secs_f64()
    );
}
