mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::deploy::DeployArgs;
use stackup_core::types::Environment;
use stackup_core::StackupError;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "stackup",
    about = "Bring up the scheduler, secrets manager and gateway in dependency order",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .stackup/ or .git/)
    #[arg(long, global = true, env = "STACKUP_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .stackup/stack.yaml
    Init,

    /// Deploy the stack (or a subset of it)
    Deploy(DeployArgs),

    /// Show the latest status of every component and the bootstrap phase
    Status,

    /// List past runs and their outcomes
    History {
        /// Only show the last N runs
        #[arg(long, short = 'n')]
        limit: Option<usize>,
    },

    /// Stop a component and restore its last config snapshot
    Rollback {
        component: String,

        /// Target environment: develop, staging or production
        #[arg(long = "env", short = 'e', env = "STACKUP_ENV", default_value = "develop")]
        environment: Environment,
    },

    /// Delete stored config snapshots
    PruneSnapshots {
        /// Only this component (default: all)
        component: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Deploy(_) | Commands::Rollback { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root).map(|_| 0),
        Commands::Deploy(args) => cmd::deploy::run(&root, args, cli.json),
        Commands::Status => cmd::status::run(&root, cli.json).map(|_| 0),
        Commands::History { limit } => cmd::history::run(&root, limit, cli.json).map(|_| 0),
        Commands::Rollback {
            component,
            environment,
        } => cmd::rollback::run(&root, &component, environment, cli.json).map(|_| 0),
        Commands::PruneSnapshots { component } => {
            cmd::snapshots::prune(&root, component.as_deref(), cli.json).map(|_| 0)
        }
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            std::process::exit(exit_code(&e));
        }
    }
}

/// `2` for usage and precondition problems, `1` for everything else.
fn exit_code(e: &anyhow::Error) -> i32 {
    e.chain()
        .find_map(|c| c.downcast_ref::<StackupError>())
        .map(StackupError::exit_code)
        .unwrap_or(1)
}
