use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Local background job queue
#[derive(Parser, Debug)]
#[command(name = "jobq", version, about, long_about = None)]
pub struct Cli {
    /// Storage directory (default: ~/.jobq)
    #[arg(long, global = true, env = "JOBQ_HOME")]
    pub storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(default_storage_dir)
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".jobq"))
        .unwrap_or_else(|| PathBuf::from(".jobq"))
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a job from JSON, e.g. '{"command": "echo hi", "priority": 5}'
    Enqueue {
        /// Job JSON
        #[arg(conflicts_with = "file", required_unless_present = "file")]
        json: Option<String>,
        /// Read the job JSON from a file
        #[arg(long, short)]
        file: Option<PathBuf>,
        /// Validate only, do not enqueue
        #[arg(long)]
        validate: bool,
    },
    /// List jobs in dispatch order
    List {
        /// pending, processing, completed, failed or dead
        #[arg(long, short)]
        state: Option<String>,
        #[arg(long, short)]
        limit: Option<usize>,
    },
    /// Job counts per state and running workers
    Status,
    /// Manage worker processes
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    /// Inspect and manage the dead-letter queue
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Expire stale leases and requeue jobs abandoned in processing
    Recover {
        /// Minimum age in seconds (default: job_lock_timeout)
        #[arg(long)]
        max_age: Option<u64>,
    },
    /// Delete old completed jobs
    Purge {
        /// Minimum age in hours (default: cleanup_completed_after_hours)
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommand {
    /// Start worker processes in the background
    Start {
        #[arg(long, short, default_value = "1")]
        count: usize,
    },
    /// Stop all running workers
    Stop {
        /// Skip the graceful wait
        #[arg(long)]
        force: bool,
        /// Seconds to wait for workers to finish their current job
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
    /// Show running workers
    Status,
    /// Run one worker in the foreground (used by `worker start`)
    #[command(hide = true)]
    Run {
        #[arg(long)]
        worker_id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum DlqCommand {
    List {
        #[arg(long, short)]
        limit: Option<usize>,
    },
    /// Move dead jobs back to pending
    Retry {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        job_id: Option<String>,
        #[arg(long)]
        all: bool,
        /// Keep the attempt count instead of resetting it
        #[arg(long)]
        keep_attempts: bool,
    },
    /// Permanently delete a dead job
    Remove { job_id: String },
    /// Permanently delete every dead job
    Clear,
    Stats,
    /// Classify a dead job's failure and suggest fixes
    Analyze { job_id: String },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    Show,
    Get { key: String },
    /// Set a value; parsed as JSON when possible, else taken as a string
    Set { key: String, value: String },
    /// Restore defaults
    Reset,
}
