use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use drone_dispatch::config::{DispatcherConfig, DroneConfig, OffloaderConfig, SshConfig};
use drone_dispatch::dispatch::ThreadedTaskQueue;
use drone_dispatch::drone::{Call, DroneRegistry, DroneUtility};
use drone_dispatch::notify::{Notifier, TracingNotifier};
use drone_dispatch::offload::{Offloader, StatusFileCompletionService};
use drone_dispatch::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "drone-dispatch")]
#[command(version)]
#[command(about = "Drone call dispatch and job result offloading")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Offload finished job results until interrupted
    Offload(OffloadArgs),

    /// Run one call on a set of drones and print what each returned
    Call(CallArgs),

    /// Execute a call batch read from stdin (run on the drone side)
    Utility,
}

// =============================================================================
// Offload Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct OffloadArgs {
    /// Results root holding the job directories
    #[arg(long, default_value = "/usr/local/autotest/results")]
    results_dir: PathBuf,

    /// JSON file with job and special task completion times
    #[arg(long)]
    status_file: PathBuf,

    /// Offload both regular jobs and special tasks
    #[arg(short = 'a', long)]
    all: bool,

    /// Offload only special tasks
    #[arg(short = 's', long, conflicts_with = "all")]
    hosts: bool,

    /// Number of parallel offload workers
    #[arg(short = 'p', long, default_value = "1")]
    parallelism: usize,

    /// Delete results instead of uploading them
    #[arg(short = 'o', long)]
    delete_only: bool,

    /// Minimum job age in days before offloading
    #[arg(short = 'd', long, default_value = "0")]
    days_old: u32,

    /// Destination bucket URI
    #[arg(long, default_value = "gs://chromeos-autotest-results/")]
    gs_uri: String,

    /// gsutil executable
    #[arg(long, default_value = "gsutil")]
    gsutil: String,

    /// Use `gsutil cp` instead of `gsutil rsync`
    #[arg(long)]
    no_rsync: bool,

    /// Pass -m to gsutil
    #[arg(short = 'm', long)]
    multiprocessing: bool,

    /// Link included in failure reports
    #[arg(long)]
    helper_url: Option<String>,

    /// Seconds to pause between cycles
    #[arg(long, default_value = "5")]
    sleep_secs: u64,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

// =============================================================================
// Call Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CallArgs {
    /// Drone hostnames (comma-separated); "localhost" runs in-process
    #[arg(long, default_value = "localhost")]
    drones: String,

    /// Results directory each drone initializes on first use
    #[arg(long, default_value = "/usr/local/autotest/results")]
    results_dir: PathBuf,

    /// Remote user for ssh
    #[arg(long)]
    ssh_user: Option<String>,

    /// Helper command run on remote drones
    #[arg(long, default_value = "drone-dispatch utility")]
    helper: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Method to call
    method: String,

    /// Positional arguments, each parsed as JSON (bare words become strings)
    args: Vec<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct DroneResultOutput {
    hostname: String,
    results: Vec<Value>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_drones(drones_str: &str) -> Vec<DroneConfig> {
    drones_str
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(DroneConfig::new)
        .collect()
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn init_logging() {
    // stdout carries the utility protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

// =============================================================================
// Subcommand Implementations
// =============================================================================

async fn run_offload(args: OffloadArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = OffloaderConfig::new(args.results_dir)
        .with_parallelism(args.parallelism)
        .with_age_limit(args.days_old);
    if args.all {
        config = config.all();
    } else if args.hosts {
        config = config.hosts_only();
    }
    config.delete_only = args.delete_only;
    config.gs_uri = args.gs_uri;
    config.gsutil = vec![args.gsutil];
    config.use_rsync = !args.no_rsync;
    config.multiprocessing = args.multiprocessing;
    config.helper_url = args.helper_url;
    config.sleep_secs = args.sleep_secs;

    let service = Arc::new(StatusFileCompletionService::new(args.status_file));
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let mut offloader = Offloader::new(config, service, notifier);

    if args.once {
        let summary = offloader.offload_once().await?;
        tracing::info!(?summary, "Offload cycle complete");
        return Ok(());
    }

    let shutdown = install_shutdown_handler()?;
    offloader.run(shutdown).await;
    Ok(())
}

async fn run_call(args: CallArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = DispatcherConfig {
        results_dir: args.results_dir,
        drones: parse_drones(&args.drones),
        ssh: SshConfig {
            user: args.ssh_user,
            helper_command: args.helper,
            ..SshConfig::default()
        },
    };
    if config.drones.is_empty() {
        return Err("no drones given".into());
    }

    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let mut registry = DroneRegistry::from_config(&config, notifier);

    let mut call = Call::new(args.method.as_str());
    for raw in &args.args {
        call = call.arg(parse_arg(raw));
    }
    let hostnames: Vec<String> = registry.hostnames().iter().map(|h| h.to_string()).collect();
    for hostname in &hostnames {
        registry.ensure_started(hostname)?;
        registry.get_mut(hostname)?.queue_call(call.clone());
    }

    let queue = ThreadedTaskQueue::new();
    let results = registry.execute_actions(&queue).await;
    registry.shutdown();
    let results = results?;

    let mut rows: Vec<DroneResultOutput> = results
        .into_iter()
        .map(|(hostname, results)| DroneResultOutput { hostname, results })
        .collect();
    rows.sort_by(|a, b| a.hostname.cmp(&b.hostname));

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Table => {
            println!("{:<30} RESULT", "DRONE");
            for row in rows {
                // The last result belongs to the requested call; earlier
                // ones are initialization.
                let result = row.results.last().cloned().unwrap_or(Value::Null);
                println!("{:<30} {}", row.hostname, result);
            }
        }
    }
    Ok(())
}

fn run_utility() -> Result<(), Box<dyn std::error::Error>> {
    let mut payload = String::new();
    std::io::stdin().read_to_string(&mut payload)?;
    let response = DroneUtility::default().execute_payload(&payload)?;
    println!("{}", response);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Offload(offload_args) => run_offload(offload_args).await,
        Commands::Call(call_args) => run_call(call_args).await,
        Commands::Utility => run_utility(),
    }
}
