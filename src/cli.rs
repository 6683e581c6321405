// Camera Central CLI binary (camctl)

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use camcentral_lib::config::{load_env_file, ConverterConfig, StoreArgs};
use camcentral_lib::constants::{DEFAULT_STALE_CHECK_INTERVAL_SECONDS, DEFAULT_STALE_CLAIM_MINUTES};
use camcentral_lib::db::schema::{self, JobStatus};
use camcentral_lib::db::Store;
use camcentral_lib::jobs::reaper::{sweep_stale_claims, ReaperSettings};
use camcentral_lib::jobs::worker::run_once;
use camcentral_lib::logging::init_logging;

#[derive(Parser)]
#[command(name = "camctl")]
#[command(about = "Camera Central - inspect and manage MP4 conversion jobs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the job store
    Init {
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Queue a raw video for conversion
    Enqueue {
        /// Source path relative to the media root
        source_path: String,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// List jobs, newest first
    Jobs {
        /// Filter by status (pending, processing, complete, failed)
        #[arg(long)]
        status: Option<JobStatus>,
        /// Maximum jobs to show
        #[arg(long, default_value = "50")]
        limit: i64,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Job counts per status
    Stats {
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Return stale claims to pending now
    Reap {
        /// Claims older than this are returned to pending
        #[arg(long, env = "STALE_CLAIM_MINUTES", default_value_t = DEFAULT_STALE_CLAIM_MINUTES)]
        stale_claim_minutes: u64,
        /// Warn about claims older than this many stale thresholds
        #[arg(long, env = "STALE_FLAG_MULTIPLE")]
        stale_flag_multiple: Option<u32>,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Put a failed job back in the queue
    Retry {
        /// Job ID
        id: i64,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Claim and convert at most one job in the foreground
    RunOnce {
        #[command(flatten)]
        config: ConverterConfig,
    },
}

fn main() -> Result<()> {
    load_env_file();
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::RunOnce { config } => config.log_file.clone(),
        _ => None,
    };
    init_logging(log_file.as_deref())?;

    match cli.command {
        Commands::Init { store } => cmd_init(store),
        Commands::Enqueue { source_path, store } => cmd_enqueue(store, &source_path),
        Commands::Jobs { status, limit, json, store } => cmd_jobs(store, status, limit, json),
        Commands::Stats { store } => cmd_stats(store),
        Commands::Reap { stale_claim_minutes, stale_flag_multiple, store } => {
            cmd_reap(store, stale_claim_minutes, stale_flag_multiple)
        }
        Commands::Retry { id, store } => cmd_retry(store, id),
        Commands::RunOnce { config } => cmd_run_once(config),
    }
}

fn cmd_init(store: StoreArgs) -> Result<()> {
    Store::open(&store.db_path)?;
    println!("Job store ready at {}", store.db_path.display());
    Ok(())
}

fn cmd_enqueue(store: StoreArgs, source_path: &str) -> Result<()> {
    let store = Store::open(&store.db_path)?;
    let id = schema::insert_job(store.conn(), source_path)?;
    let job = schema::get_job(store.conn(), id)?
        .ok_or_else(|| anyhow::anyhow!("job {} vanished after insert", id))?;
    println!("Job {}: {} -> {} [{}]", job.id, job.source_path, job.output_path, job.status);
    Ok(())
}

fn cmd_jobs(store: StoreArgs, status: Option<JobStatus>, limit: i64, json: bool) -> Result<()> {
    let store = Store::open(&store.db_path)?;
    let jobs = schema::list_jobs(store.conn(), status, limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!("{:<6} {:<11} {:<8} {:<10} {}", "ID", "STATUS", "ATTEMPTS", "DURATION", "SOURCE");
    println!("{}", "-".repeat(72));
    for job in &jobs {
        let duration = job
            .result_duration
            .map(|d| format!("{}s", d))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<11} {:<8} {:<10} {}",
            job.id, job.status, job.attempts, duration, job.source_path
        );
        if let Some(owner) = &job.claimed_by {
            println!("       claimed by {} at {}", owner, job.claimed_at.as_deref().unwrap_or("?"));
        }
        if let Some(err) = &job.last_error {
            println!("       error: {}", err);
        }
    }
    Ok(())
}

fn cmd_stats(store: StoreArgs) -> Result<()> {
    let store = Store::open(&store.db_path)?;
    let counts = schema::count_jobs_by_status(store.conn())?;
    let total: i64 = counts.iter().map(|(_, n)| n).sum();

    for (status, count) in &counts {
        println!("{:<11} {}", status, count);
    }
    println!("{:<11} {}", "total", total);
    Ok(())
}

fn cmd_reap(store: StoreArgs, stale_claim_minutes: u64, flag_multiple: Option<u32>) -> Result<()> {
    if stale_claim_minutes == 0 {
        anyhow::bail!("stale-claim-minutes must be greater than zero");
    }

    let store = Store::open(&store.db_path)?;
    let settings = ReaperSettings {
        threshold: Duration::from_secs(stale_claim_minutes * 60),
        interval: Duration::from_secs(DEFAULT_STALE_CHECK_INTERVAL_SECONDS),
        flag_multiple,
    };
    let report = sweep_stale_claims(store.conn(), &settings)?;

    println!(
        "Reset {} stale claim(s); {} flagged as overdue; {} changed hands during the sweep",
        report.reset, report.flagged, report.skipped
    );
    Ok(())
}

fn cmd_retry(store: StoreArgs, id: i64) -> Result<()> {
    let store = Store::open(&store.db_path)?;
    if schema::retry_failed_job(store.conn(), id)? {
        println!("Job {} returned to pending", id);
    } else {
        let status = schema::get_job(store.conn(), id)?
            .map(|j| j.status.to_string())
            .unwrap_or_default();
        anyhow::bail!("Job {} is {}, only failed jobs can be retried", id, status);
    }
    Ok(())
}

fn cmd_run_once(config: ConverterConfig) -> Result<()> {
    config.validate()?;
    config.check_tools()?;
    let settings = config.daemon_settings()?;

    match run_once(&settings)? {
        Some((id, outcome)) => println!("Job {}: {}", id, outcome.label()),
        None => println!("No pending jobs."),
    }
    Ok(())
}
