use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use jobspool::config::SchedulerConfig;
use jobspool::scheduler::{Job, JobStore, Scheduler};
use jobspool::shutdown::install_shutdown_handler;
use jobspool::worker::TaskRegistry;

#[derive(Parser, Debug)]
#[command(name = "jobspool")]
#[command(version)]
#[command(about = "A local job scheduler backed by a durable file spool")]
#[command(propagate_version = true)]
struct Args {
    /// Directory holding the job queues and the lock file
    #[arg(long, short = 'd', global = true, default_value = ".")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler until SIGINT/SIGTERM
    Run(RunArgs),

    /// Queue a new job
    Submit(SubmitArgs),

    /// List queued jobs
    Status {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Pause a queued job (needs the queue lock, so no scheduler may be running)
    Pause {
        /// Job ID
        job_id: Uuid,
    },

    /// Resume a paused job (needs the queue lock, so no scheduler may be running)
    Resume {
        /// Job ID
        job_id: Uuid,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Number of worker slots
    #[arg(long, default_value = "10")]
    pool_size: usize,

    /// Delay between two passes over the queue directories
    #[arg(long, default_value = "100")]
    poll_interval_ms: u64,

    /// How long to wait for running jobs on shutdown
    #[arg(long, default_value = "30")]
    drain_timeout_secs: u64,
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Task to run (sleep, echo, touch, shell)
    task: String,

    /// Task arguments as JSON, e.g. '{"command": "echo hello"}'
    #[arg(long, default_value = "null")]
    args: String,

    /// Start the job this many seconds from now
    #[arg(long)]
    delay_secs: Option<u64>,

    /// Give up after this many failed attempts (0 retries forever)
    #[arg(long, default_value = "0")]
    tries: u32,

    /// Ask the job to stop after running this long (0 means no limit)
    #[arg(long, default_value = "0")]
    max_working_time_secs: u64,

    /// Queue the job paused
    #[arg(long)]
    paused: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct QueuedJobOutput {
    job_id: String,
    queue: String,
    task: String,
    args: serde_json::Value,
    paused: bool,
    start_at: Option<String>,
    tries: u32,
    created_at: String,
}

// =============================================================================
// Commands
// =============================================================================

async fn run_scheduler(
    data_dir: PathBuf,
    args: RunArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = SchedulerConfig::in_dir(&data_dir)
        .with_pool_size(args.pool_size)
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms));

    let scheduler = Scheduler::new(config, TaskRegistry::with_builtins()).await?;
    let shutdown = install_shutdown_handler();

    scheduler.run();
    shutdown.cancelled().await;

    let drained = scheduler
        .shutdown(Duration::from_secs(args.drain_timeout_secs))
        .await;
    if !drained {
        tracing::warn!("Unfinished jobs stay queued and run again on next start");
    }
    Ok(())
}

async fn handle_submit(
    data_dir: PathBuf,
    args: SubmitArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = TaskRegistry::with_builtins();
    if !registry.contains(&args.task) {
        return Err(format!(
            "unknown task {:?}, expected one of: {}",
            args.task,
            registry.names().join(", ")
        )
        .into());
    }

    let task_args: serde_json::Value = serde_json::from_str(&args.args)?;
    let mut job = Job::new(args.task, task_args)
        .with_tries(args.tries)
        .with_max_working_time(Duration::from_secs(args.max_working_time_secs));
    if let Some(delay) = args.delay_secs {
        job = job.delay(Duration::from_secs(delay));
    }
    if args.paused {
        job.pause();
    }

    let store = JobStore::open(&SchedulerConfig::in_dir(&data_dir)).await?;
    let path = store.persist(&job).await?;
    tracing::debug!(path = %path.display(), "Job written");

    println!("{}", job.id());
    Ok(())
}

async fn handle_status(
    data_dir: PathBuf,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = JobStore::open(&SchedulerConfig::in_dir(&data_dir)).await?;
    let pending = store.list_pending().await?;

    match output {
        OutputFormat::Json => {
            let jobs: Vec<QueuedJobOutput> = pending
                .iter()
                .map(|p| QueuedJobOutput {
                    job_id: p.job.id().to_string(),
                    queue: p.kind.to_string(),
                    task: p.job.task().to_string(),
                    args: p.job.args().clone(),
                    paused: p.job.paused(),
                    start_at: p.job.start_at_time().map(|t| t.to_rfc3339()),
                    tries: p.job.tries(),
                    created_at: p.job.created_at().to_rfc3339(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        OutputFormat::Table => {
            if pending.is_empty() {
                println!("No queued jobs.");
                return Ok(());
            }
            println!(
                "{:<38} {:<8} {:<8} {:<26} {}",
                "JOB ID", "QUEUE", "TASK", "START AT", "ARGS"
            );
            println!("{}", "-".repeat(100));
            for p in pending {
                let queue = if p.job.paused() {
                    format!("{}*", p.kind)
                } else {
                    p.kind.to_string()
                };
                println!(
                    "{:<38} {:<8} {:<8} {:<26} {}",
                    p.job.id(),
                    queue,
                    p.job.task(),
                    p.job
                        .start_at_time()
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    p.job.args()
                );
            }
        }
    }
    Ok(())
}

async fn handle_set_paused(
    data_dir: PathBuf,
    job_id: Uuid,
    paused: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = Scheduler::new(
        SchedulerConfig::in_dir(&data_dir),
        TaskRegistry::with_builtins(),
    )
    .await?;
    if paused {
        scheduler.pause_job(job_id).await?;
        println!("Job {} paused", job_id);
    } else {
        scheduler.resume_job(job_id).await?;
        println!("Job {} resumed", job_id);
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
        Commands::Run(run_args) => run_scheduler(args.data_dir, run_args).await?,
        Commands::Submit(submit_args) => handle_submit(args.data_dir, submit_args).await?,
        Commands::Status { output } => handle_status(args.data_dir, &output).await?,
        Commands::Pause { job_id } => handle_set_paused(args.data_dir, job_id, true).await?,
        Commands::Resume { job_id } => handle_set_paused(args.data_dir, job_id, false).await?,
    }

    Ok(())
}
