use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use tt_drone::config::{ClientConfig, DroneConfig, DEFAULT_COORDINATOR_URL};
use tt_drone::coordinator::{Coordinator, CoordinatorClient};
use tt_drone::drone::{load_or_register, request_access_to_all, Drone};
use tt_drone::model::Project;
use tt_drone::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "tt-drone")]
#[command(version)]
#[command(about = "Task tracker worker: leases tasks and runs project recipes")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    coordinator: CoordinatorArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the drone (registers first if there are no credentials)
    Run(RunArgs),

    /// Register this worker and request access to every project
    Register {
        /// Alias to register under
        #[arg(long, default_value = "drone")]
        alias: String,
    },

    /// List the projects visible to this worker
    Projects {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CoordinatorArgs {
    /// Coordinator API base URL
    #[arg(long, global = true, default_value = DEFAULT_COORDINATOR_URL)]
    coordinator_url: String,

    /// Path to the worker credential file
    #[arg(long, global = true, default_value = "worker.json")]
    credentials: PathBuf,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Alias to register under on first run; also prefixes context names
    #[arg(long, default_value = "drone")]
    alias: String,

    /// Number of concurrent execution contexts
    #[arg(long, default_value = "10")]
    contexts: usize,

    /// Directory holding project checkouts
    #[arg(long, default_value = "work")]
    work_dir: PathBuf,

    /// Seconds to wait after a pass that found no task
    #[arg(long, default_value = "10")]
    idle_backoff_secs: u64,

    /// Abort tasks still running this many seconds after a shutdown request.
    /// Waits for them indefinitely if unset; a second signal aborts them at
    /// any time.
    #[arg(long)]
    shutdown_grace_secs: Option<u64>,

    /// Let recipes run past their task's max_assign_time
    #[arg(long)]
    no_time_limit: bool,

    /// Deploy projects even if their setup script fails
    #[arg(long)]
    ignore_setup_failure: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct ProjectOutput {
    id: i64,
    name: String,
    priority: i64,
    version: String,
    clone_url: String,
}

impl From<Project> for ProjectOutput {
    fn from(p: Project) -> Self {
        Self {
            id: p.id,
            name: p.name,
            priority: p.priority,
            version: p.version,
            clone_url: p.clone_url,
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Build a client authenticated with the stored (or newly registered) identity.
/// Newly registered workers always request access to every project.
async fn authenticated_client(
    args: &CoordinatorArgs,
    alias: &str,
    request_access: bool,
) -> Result<CoordinatorClient, Box<dyn std::error::Error>> {
    let client = CoordinatorClient::new(ClientConfig::new(&args.coordinator_url))?;
    let bootstrap = load_or_register(&client, &args.credentials, alias).await?;
    let client = client.with_identity(bootstrap.identity);

    if bootstrap.registered || request_access {
        let granted = request_access_to_all(&client).await?;
        tracing::info!(projects = ?granted, "Requested access to projects");
    }
    Ok(client)
}

fn drone_config(args: &RunArgs) -> DroneConfig {
    let mut config = DroneConfig::new(&args.alias)
        .with_contexts(args.contexts)
        .with_idle_backoff(Duration::from_secs(args.idle_backoff_secs))
        .with_work_dir(&args.work_dir);
    if let Some(grace) = args.shutdown_grace_secs {
        config = config.with_shutdown_grace(Duration::from_secs(grace));
    }
    config.execution.enforce_time_limit = !args.no_time_limit;
    config.execution.fail_on_setup_error = !args.ignore_setup_failure;
    config
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_drone(
    coordinator: CoordinatorArgs,
    args: RunArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    if args.contexts == 0 {
        return Err("--contexts must be at least 1".into());
    }

    let client = authenticated_client(&coordinator, &args.alias, false).await?;
    let signals = install_shutdown_handler()?;

    let drone = Drone::new(drone_config(&args), Arc::new(client))
        .with_force_shutdown(signals.force);
    let report = drone.run(signals.graceful).await;

    if !report.release_errors.is_empty() {
        tracing::warn!(
            tasks = ?report.release_errors,
            "Some tasks could not be released and will time out on the coordinator"
        );
    }
    Ok(())
}

async fn handle_register(
    coordinator: CoordinatorArgs,
    alias: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = authenticated_client(&coordinator, &alias, true).await?;
    if let Some(identity) = client.identity() {
        println!("Worker {} ({})", identity.id, identity.alias);
    }
    Ok(())
}

async fn handle_projects(
    coordinator: CoordinatorArgs,
    output_format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = authenticated_client(&coordinator, "drone", false).await?;
    let mut projects = client.list_projects().await?;
    Project::sort_by_priority(&mut projects);

    match output_format {
        OutputFormat::Json => {
            let output: Vec<ProjectOutput> = projects.into_iter().map(Into::into).collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<8} {:<30} {:<10} {:<12} CLONE URL",
                "ID", "NAME", "PRIORITY", "VERSION"
            );
            println!("{}", "-".repeat(90));
            for p in projects {
                let version = if p.version.is_empty() {
                    "-".to_string()
                } else {
                    p.version.chars().take(12).collect()
                };
                println!(
                    "{:<8} {:<30} {:<10} {:<12} {}",
                    p.id, p.name, p.priority, version, p.clone_url
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Run(run_args) => {
            run_drone(args.coordinator, run_args).await?;
        }
        Commands::Register { alias } => {
            handle_register(args.coordinator, alias).await?;
        }
        Commands::Projects { output } => {
            handle_projects(args.coordinator, output).await?;
        }
    }

    Ok(())
}
