use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use queuectl::config;
use queuectl::error::{QueueError, Result};
use queuectl::job::{Job, JobState};
use queuectl::queue::Queue;
use queuectl::shutdown;
use queuectl::store::Store;
use queuectl::supervisor::{self, Supervisor, STOP_GRACE};
use queuectl::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(about = "Background job queue with retries, exponential backoff and a dead-letter queue")]
struct Cli {
    /// Path to the SQLite store
    #[arg(
        long,
        global = true,
        default_value = "queuectl.db",
        env = "QUEUECTL_DB"
    )]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enqueue a job: a JSON spec ('{"id":"j1","command":"sleep 2"}') or a bare command string
    Enqueue {
        spec: String,

        /// Retry budget for this job (wins over the JSON spec and the config default)
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Manage worker processes
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Show per-state job counts and active workers
    Status {
        /// Report how many stuck jobs the sweep recovered
        #[arg(long)]
        reset_stuck: bool,

        /// Stuck threshold in seconds for this sweep (default: config)
        #[arg(long)]
        stuck_timeout: Option<u64>,
    },

    /// List jobs, optionally filtered by state
    List {
        /// pending, processing, completed or dead
        #[arg(long)]
        state: Option<String>,
    },

    /// Inspect and re-admit dead-letter jobs
    #[command(subcommand)]
    Dlq(DlqCommand),

    /// Read or change configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum WorkerCommand {
    /// Start worker processes
    Start {
        /// Number of worker processes
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Seconds between polls when the queue is empty (default: config)
        #[arg(long)]
        poll_interval: Option<f64>,
    },

    /// Gracefully stop all running workers
    Stop,

    /// Internal: run one worker loop in this process
    #[command(hide = true)]
    Run {
        #[arg(long)]
        worker_id: String,

        #[arg(long)]
        poll_interval: Option<f64>,
    },
}

#[derive(Subcommand, Debug)]
enum DlqCommand {
    /// List dead jobs
    List,

    /// Move a dead job back to pending with a fresh retry budget
    Retry { id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print one key or the whole table
    Get {
        #[arg(long)]
        key: Option<String>,
    },

    /// Validate and set a configuration value
    Set { key: String, value: String },
}

#[derive(Deserialize)]
struct JobSpec {
    id: Option<String>,
    command: String,
    max_retries: Option<u32>,
}

struct ParsedSpec {
    command: String,
    id: Option<String>,
    max_retries: Option<u32>,
}

/// Anything that looks like a JSON object is parsed strictly; everything else
/// is taken as a bare command line.
fn parse_job_spec(raw: &str) -> Result<ParsedSpec> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        let spec: JobSpec =
            serde_json::from_str(trimmed).map_err(|e| QueueError::InvalidJobSpec(e.to_string()))?;
        if spec.command.trim().is_empty() {
            return Err(QueueError::InvalidJobSpec(
                "'command' must be non-empty".to_string(),
            ));
        }
        Ok(ParsedSpec {
            command: spec.command,
            id: spec.id,
            max_retries: spec.max_retries,
        })
    } else if trimmed.is_empty() {
        Err(QueueError::InvalidJobSpec("no command provided".to_string()))
    } else {
        Ok(ParsedSpec {
            command: trimmed.to_string(),
            id: None,
            max_retries: None,
        })
    }
}

fn poll_interval_arg(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(QueueError::InvalidConfigValue {
            key: "poll-interval".to_string(),
            reason: "must be > 0".to_string(),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}

fn open_queue(db_path: &Path) -> Result<Queue> {
    Ok(Queue::new(Store::open(db_path)?))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

fn print_jobs_table(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!(
        "{:<36}  {:<10}  {:>8}  {:>11}  {:<19}  {}",
        "ID", "STATE", "ATTEMPTS", "MAX_RETRIES", "CREATED", "ERROR"
    );
    for job in jobs {
        let error = truncate(job.error_message.as_deref().unwrap_or("-"), 48);
        println!(
            "{:<36}  {:<10}  {:>8}  {:>11}  {:<19}  {}",
            truncate(&job.id, 36),
            job.state.as_str(),
            job.attempts,
            job.max_retries,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            error
        );
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Enqueue { spec, max_retries } => {
            let queue = open_queue(&cli.db_path)?;
            let parsed = parse_job_spec(&spec)?;
            let retries = max_retries.or(parsed.max_retries);
            let job = queue.enqueue(&parsed.command, parsed.id, retries)?;
            println!("Job enqueued: {}", job.id);
            println!("Command: {}", job.command);
            println!("Max retries: {}", job.max_retries);
        }

        Commands::Worker(cmd) => match cmd {
            WorkerCommand::Start {
                count,
                poll_interval,
            } => {
                if let Some(secs) = poll_interval {
                    poll_interval_arg(secs)?;
                }
                // Create the store up front so workers don't race on schema setup.
                open_queue(&cli.db_path)?;
                let records = Supervisor::new(&cli.db_path)
                    .start(count, poll_interval)
                    .await?;
                println!("Started {} worker(s)", records.len());
                for record in &records {
                    println!("  worker {} (pid {})", record.worker_id, record.pid);
                }
            }
            WorkerCommand::Stop => {
                let stopped = Supervisor::new(&cli.db_path).stop(STOP_GRACE).await?;
                if stopped == 0 {
                    println!("No running workers found.");
                } else {
                    println!("Stopped {stopped} worker(s)");
                }
            }
            WorkerCommand::Run {
                worker_id,
                poll_interval,
            } => {
                let queue = open_queue(&cli.db_path)?;
                let poll = match poll_interval {
                    Some(secs) => poll_interval_arg(secs)?,
                    None => config::poll_interval(queue.store())?,
                };
                let token = shutdown::install_shutdown_handler();
                let dir = supervisor::liveness_dir(&cli.db_path);
                Worker::new(queue, worker_id, dir, poll, token).run().await?;
            }
        },

        Commands::Status {
            reset_stuck,
            stuck_timeout,
        } => {
            let queue = open_queue(&cli.db_path)?;
            let timeout = match stuck_timeout {
                Some(secs) => Duration::from_secs(secs),
                None => config::stuck_timeout(queue.store())?,
            };
            let recovered = queue.reset_stuck(timeout)?;
            if reset_stuck || recovered > 0 {
                println!("Recovered {recovered} stuck job(s)");
            }

            let counts = queue.store().counts_by_state()?;
            println!("Jobs:");
            if counts.is_empty() {
                println!("  No jobs found.");
            }
            for (state, count) in &counts {
                println!("  {:<12} {}", state.as_str(), count);
            }

            let workers = Supervisor::new(&cli.db_path).live_workers()?;
            println!("Workers:");
            if workers.is_empty() {
                println!("  No active workers.");
            }
            for worker in &workers {
                println!(
                    "  worker {} (pid {}, started {})",
                    worker.worker_id,
                    worker.pid,
                    worker.started_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        Commands::List { state } => {
            let queue = open_queue(&cli.db_path)?;
            let filter = state.map(|s| s.parse::<JobState>()).transpose()?;
            print_jobs_table(&queue.list(filter, None)?);
        }

        Commands::Dlq(cmd) => match cmd {
            DlqCommand::List => {
                let jobs = open_queue(&cli.db_path)?.dlq_list()?;
                if jobs.is_empty() {
                    println!("Dead-letter queue is empty.");
                } else {
                    print_jobs_table(&jobs);
                }
            }
            DlqCommand::Retry { id } => {
                let job = open_queue(&cli.db_path)?.dlq_retry(&id)?;
                println!("Job {} moved back to pending", job.id);
            }
        },

        Commands::Config(cmd) => match cmd {
            ConfigCommand::Get { key } => {
                let store = Store::open(&cli.db_path)?;
                match key {
                    Some(key) => println!("{key} = {}", config::get(&store, &key)?),
                    None => {
                        for (key, value) in store.config_all()? {
                            println!("{key} = {value}");
                        }
                    }
                }
            }
            ConfigCommand::Set { key, value } => {
                let store = Store::open(&cli.db_path)?;
                config::set(&store, &key, &value)?;
                println!("Configuration updated: {key} = {value}");
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_command_spec() {
        let parsed = parse_job_spec("echo hello").unwrap();
        assert_eq!(parsed.command, "echo hello");
        assert!(parsed.id.is_none());
        assert!(parsed.max_retries.is_none());
    }

    #[test]
    fn json_spec_with_all_fields() {
        let parsed =
            parse_job_spec(r#"{"id":"j1","command":"sleep 2","max_retries":5}"#).unwrap();
        assert_eq!(parsed.command, "sleep 2");
        assert_eq!(parsed.id.as_deref(), Some("j1"));
        assert_eq!(parsed.max_retries, Some(5));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            parse_job_spec(r#"{"id":"j1""#),
            Err(QueueError::InvalidJobSpec(_))
        ));
    }

    #[test]
    fn json_without_command_is_rejected() {
        assert!(matches!(
            parse_job_spec(r#"{"id":"j1"}"#),
            Err(QueueError::InvalidJobSpec(_))
        ));
        assert!(matches!(
            parse_job_spec(r#"{"command":"  "}"#),
            Err(QueueError::InvalidJobSpec(_))
        ));
    }

    #[test]
    fn empty_spec_is_rejected() {
        assert!(parse_job_spec("   ").is_err());
    }
}
