mod check_cmd;
mod config;
mod gh;
mod report;
mod sync_cmd;
#[cfg(test)]
mod test_util;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use sprintsync_core::SprintRange;

use config::{Overrides, ResolvedConfig};

#[derive(Parser)]
#[command(
    name = "sprintsync",
    version,
    about = "Synchronize a sprint plan into issue tracker labels, milestones, and issues"
)]
struct Cli {
    /// Config file (overrides SPRINTSYNC_CONFIG and the default locations)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a plan without contacting the tracker
    Check {
        /// Path to the plan document
        plan: PathBuf,
        /// Print the parsed plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create missing labels, milestones, and issues for a plan
    Sync {
        /// Path to the plan document
        plan: PathBuf,
        /// Run against an in-memory tracker instead of GitHub
        #[arg(long)]
        dry_run: bool,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
        /// Target repository as owner/name
        #[arg(long)]
        repo: Option<String>,
        /// Workers per partition
        #[arg(long)]
        concurrency: Option<usize>,
        /// Number of sprint partitions processed in parallel
        #[arg(long)]
        partitions: Option<usize>,
        /// Only sync these sprints (e.g. "2-4" or "3")
        #[arg(long)]
        sprints: Option<SprintRange>,
    },
    /// Write a starter config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

/// Execute the `sprintsync init` command: write a starter config file.
fn cmd_init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    config::save_config(&config::starter_config(), path)?;

    println!("Config written to {}", path.display());
    println!();
    println!("Next: set organization and repository, then run `sprintsync check <plan.md>`.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Check { plan, json } => check_cmd::run_check(&plan, json)?,
        Commands::Sync {
            plan,
            dry_run,
            json,
            repo,
            concurrency,
            partitions,
            sprints,
        } => {
            let overrides = Overrides {
                config: cli.config,
                repo,
                concurrency,
                partitions,
                sprints,
            };
            let resolved = ResolvedConfig::resolve(&overrides)?;
            let options = sync_cmd::SyncOptions { dry_run, json };
            sync_cmd::run_sync_command(&plan, &resolved, options).await?
        }
        Commands::Init { force } => {
            let path = cli.config.unwrap_or_else(config::config_path);
            cmd_init(&path, force)?;
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
