mod logs_cmd;
mod merge_cmd;
mod resolve;
mod retry_cmd;
mod rush_cmd;
mod status_cmd;
mod stop_cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "zerg", about = "Level-ordered multi-worker build orchestrator")]
struct Cli {
    /// Repository root (defaults to the current directory)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Feature to operate on (overrides ZERG_FEATURE and auto-detection)
    #[arg(long, global = true)]
    feature: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator and drive the build to completion
    Rush {
        /// Task graph JSON (defaults to .gsd/specs/<feature>/tasks.json)
        #[arg(long)]
        graph: Option<PathBuf>,
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<u32>,
        /// Override the configured target branch
        #[arg(long)]
        target: Option<String>,
    },
    /// Retry a failed task (or every failed task)
    Retry {
        /// Task ID to retry
        task_id: Option<String>,
        /// Retry every failed task
        #[arg(long)]
        all_failed: bool,
    },
    /// Run the level merge flow directly
    Merge {
        /// Level to merge
        level: u32,
        /// Target branch
        #[arg(long, default_value = "main")]
        target: String,
    },
    /// Query aggregated worker logs
    Logs {
        /// Filter by worker id ("orchestrator" selects the orchestrator)
        #[arg(long)]
        worker: Option<String>,
        /// Filter by task id
        #[arg(long)]
        task: Option<String>,
        /// Filter by log level (debug, info, warn, error)
        #[arg(long)]
        level: Option<String>,
        /// Filter by execution phase
        #[arg(long)]
        phase: Option<String>,
        /// Filter by event type
        #[arg(long)]
        event: Option<String>,
        /// Filter by task execution level
        #[arg(long)]
        zerg_level: Option<u32>,
        /// Only entries at or after this ISO-8601 timestamp
        #[arg(long)]
        since: Option<String>,
        /// Only entries at or before this ISO-8601 timestamp
        #[arg(long)]
        until: Option<String>,
        /// Case-insensitive substring search in messages
        #[arg(long)]
        search: Option<String>,
        /// Maximum entries to print
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Signal a running orchestrator to shut down gracefully
    Stop,
    /// Show the feature's current state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let repo_root = resolve::repo_root(cli.repo)?;

    match cli.command {
        Commands::Rush {
            graph,
            workers,
            target,
        } => {
            let feature = resolve::require_feature(&repo_root, cli.feature)?;
            let code =
                rush_cmd::run_rush(&repo_root, &feature, graph, workers, target).await?;
            std::process::exit(code.code());
        }
        Commands::Retry {
            task_id,
            all_failed,
        } => {
            let feature = resolve::require_feature(&repo_root, cli.feature)?;
            retry_cmd::run_retry(&repo_root, &feature, task_id.as_deref(), all_failed)
        }
        Commands::Merge { level, target } => {
            let feature = resolve::require_feature(&repo_root, cli.feature)?;
            merge_cmd::run_merge(&repo_root, &feature, level, &target).await
        }
        Commands::Logs {
            worker,
            task,
            level,
            phase,
            event,
            zerg_level,
            since,
            until,
            search,
            limit,
        } => logs_cmd::run_logs(
            &repo_root,
            logs_cmd::LogsArgs {
                worker,
                task,
                level,
                phase,
                event,
                zerg_level,
                since,
                until,
                search,
                limit,
            },
        ),
        Commands::Stop => {
            let feature = resolve::require_feature(&repo_root, cli.feature)?;
            stop_cmd::run_stop(&repo_root, &feature)
        }
        Commands::Status => {
            let feature = resolve::require_feature(&repo_root, cli.feature)?;
            status_cmd::run_status(&repo_root, &feature)
        }
    }
}
