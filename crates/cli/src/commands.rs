use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, bail};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use jobq_core::{Job, JobError, JobId, JobState, NewJob, WorkerId};
use jobq_dlq::DeadLetterQueue;
use jobq_store::config::{parse_cli_value, validation_rules};
use jobq_store::{ConfigStore, FileJobStore, JobStore, LockOptions, StoreOptions};
use jobq_worker::{WorkerPool, run_worker_process};

use crate::args::{Command, ConfigCommand, DlqCommand, WorkerCommand};

/// Handles opened once per invocation.
#[derive(Debug)]
pub struct Context {
    pub dir: PathBuf,
    pub store: FileJobStore,
    pub config: ConfigStore,
}

impl Context {
    pub fn open(dir: PathBuf) -> anyhow::Result<Self> {
        let config = ConfigStore::open(&dir, LockOptions::default())
            .with_context(|| format!("cannot open storage at {}", dir.display()))?;
        let store = FileJobStore::open_with(
            &dir,
            StoreOptions {
                lease_ttl: config.load().lease_ttl(),
                ..StoreOptions::default()
            },
        )?;
        Ok(Self { dir, store, config })
    }
}

pub fn run(ctx: &Context, command: Command) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run_with(ctx, command, &mut out)
}

/// Dispatch one command, writing its report to `out`.
pub fn run_with(ctx: &Context, command: Command, out: &mut dyn Write) -> anyhow::Result<()> {
    match command {
        Command::Enqueue {
            json,
            file,
            validate,
        } => {
            let raw = match (json, file) {
                (Some(json), _) => json,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read {}", path.display()))?,
                (None, None) => bail!("either job JSON or --file is required"),
            };
            enqueue(ctx, &raw, validate, out)
        }
        Command::List { state, limit } => {
            let state = state.as_deref().map(JobState::from_str).transpose()?;
            let jobs = ctx.store.list_jobs(state, limit)?;
            print_jobs(&jobs, out)
        }
        Command::Status => status(ctx, out),
        Command::Worker { command } => worker(ctx, command, out),
        Command::Dlq { command } => dlq(ctx, command, out),
        Command::Config { command } => config(ctx, command, out),
        Command::Recover { max_age } => {
            let max_age = max_age
                .map(Duration::from_secs)
                .unwrap_or_else(|| ctx.config.load().lease_ttl());
            let expired = ctx.store.expire_stale_locks(max_age)?;
            let requeued = ctx.store.requeue_orphaned(max_age)?;
            writeln!(out, "Expired {expired} stale lease(s)")?;
            writeln!(out, "Requeued {} orphaned job(s)", requeued.len())?;
            for id in requeued {
                writeln!(out, "  {id}")?;
            }
            Ok(())
        }
        Command::Purge { older_than_hours } => {
            let older_than = older_than_hours
                .map(|h| Duration::from_secs(h.saturating_mul(3600)))
                .unwrap_or_else(|| ctx.config.load().completed_retention());
            let purged = ctx.store.purge_completed(older_than)?;
            writeln!(out, "Purged {purged} completed job(s)")?;
            Ok(())
        }
    }
}

fn enqueue(ctx: &Context, raw: &str, validate: bool, out: &mut dyn Write) -> anyhow::Result<()> {
    let new: NewJob = serde_json::from_str(raw).context("invalid job JSON")?;
    let job = new.into_job(ctx.config.load().max_retries)?;

    if validate {
        writeln!(out, "Job is valid: {}", job.id)?;
        return Ok(());
    }
    if !ctx.store.add_job(&job)? {
        return Err(JobError::Conflict(job.id).into());
    }
    writeln!(out, "Enqueued job {}", job.id)?;
    Ok(())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn print_jobs(jobs: &[Job], out: &mut dyn Write) -> anyhow::Result<()> {
    if jobs.is_empty() {
        writeln!(out, "No jobs found")?;
        return Ok(());
    }
    writeln!(
        out,
        "{:<38} {:<10} {:>8} {:>8} {:<19} COMMAND",
        "ID", "STATE", "ATTEMPTS", "PRIORITY", "CREATED"
    )?;
    for job in jobs {
        writeln!(
            out,
            "{:<38} {:<10} {:>8} {:>8} {:<19} {}",
            job.id.as_str(),
            job.state.as_str(),
            format!("{}/{}", job.attempts, job.max_retries),
            job.priority,
            timestamp(job.created_at),
            job.command
        )?;
    }
    Ok(())
}

fn status(ctx: &Context, out: &mut dyn Write) -> anyhow::Result<()> {
    let counts = ctx.store.job_counts()?;
    writeln!(out, "Jobs:")?;
    for (state, count) in &counts {
        writeln!(out, "  {:<10} {count}", state.as_str())?;
    }
    writeln!(out, "  {:<10} {}", "total", counts.values().sum::<usize>())?;
    let running = WorkerPool::running_workers(&ctx.dir);
    writeln!(out, "Workers running: {}", running.len())?;
    Ok(())
}

fn worker(ctx: &Context, command: WorkerCommand, out: &mut dyn Write) -> anyhow::Result<()> {
    match command {
        WorkerCommand::Start { count } => {
            let max = ctx.config.load().max_workers as usize;
            if count == 0 || count > max {
                bail!("worker count must be between 1 and {max}");
            }
            let mut pool = WorkerPool::for_current_exe(&ctx.dir)?;
            for id in pool.start_workers(count)? {
                writeln!(out, "Started {id}")?;
            }
            writeln!(out, "Logs: {}", ctx.dir.join("logs").display())?;
        }
        WorkerCommand::Stop { force, timeout } => {
            let mut pool = WorkerPool::for_current_exe(&ctx.dir)?;
            let report = pool.stop_workers(!force, Duration::from_secs(timeout))?;
            writeln!(
                out,
                "Stopped workers: {} graceful, {} terminated, {} killed",
                report.graceful, report.terminated, report.killed
            )?;
        }
        WorkerCommand::Status => {
            let mut pool = WorkerPool::for_current_exe(&ctx.dir)?;
            let workers = pool.status();
            if workers.is_empty() {
                writeln!(out, "No workers running")?;
            }
            for w in workers {
                let state = if w.alive { "alive" } else { "exited" };
                writeln!(out, "pid {:<8} {state}", w.pid)?;
            }
        }
        WorkerCommand::Run { worker_id } => {
            let stats = run_worker_process(&ctx.dir, WorkerId::new(worker_id))?;
            writeln!(
                out,
                "Processed {} job(s): {} succeeded, {} failed, {} dead-lettered",
                stats.processed, stats.succeeded, stats.failed, stats.dead_lettered
            )?;
        }
    }
    Ok(())
}

fn dlq(ctx: &Context, command: DlqCommand, out: &mut dyn Write) -> anyhow::Result<()> {
    let dlq = DeadLetterQueue::new(&ctx.store);
    match command {
        DlqCommand::List { limit } => print_jobs(&dlq.list_dead_jobs(limit)?, out)?,
        DlqCommand::Retry {
            job_id,
            all,
            keep_attempts,
        } => {
            if all {
                let results = dlq.retry_all_jobs(!keep_attempts)?;
                let ok = results.values().filter(|ok| **ok).count();
                writeln!(out, "Retried {ok}/{} dead job(s)", results.len())?;
            } else if let Some(raw) = job_id {
                let job = dlq.retry_job(&JobId::parse(raw)?, !keep_attempts)?;
                writeln!(out, "Job {} moved back to pending", job.id)?;
            }
        }
        DlqCommand::Remove { job_id } => {
            let id = JobId::parse(job_id)?;
            dlq.remove_job(&id)?;
            writeln!(out, "Removed job {id}")?;
        }
        DlqCommand::Clear => {
            let results = dlq.clear_all()?;
            let ok = results.values().filter(|ok| **ok).count();
            writeln!(out, "Removed {ok}/{} dead job(s)", results.len())?;
        }
        DlqCommand::Stats => {
            let stats = dlq.statistics()?;
            writeln!(out, "Dead jobs: {}", stats.total_jobs)?;
            writeln!(out, "Average attempts: {:.2}", stats.average_attempts)?;
            if let Some(job) = &stats.oldest_job {
                writeln!(out, "Oldest: {} ({})", job.id, timestamp(job.created_at))?;
            }
            if let Some(job) = &stats.newest_job {
                writeln!(out, "Newest: {} ({})", job.id, timestamp(job.created_at))?;
            }
            if !stats.common_errors.is_empty() {
                writeln!(out, "Common errors:")?;
                for (error, count) in &stats.common_errors {
                    writeln!(out, "  {count:>4}  {error}")?;
                }
            }
        }
        DlqCommand::Analyze { job_id } => {
            let analysis = dlq.analyze_failure(&JobId::parse(job_id)?)?;
            writeln!(out, "Job: {}", analysis.job_id)?;
            writeln!(out, "Command: {}", analysis.command)?;
            writeln!(
                out,
                "Attempts: {}/{}",
                analysis.total_attempts, analysis.max_retries
            )?;
            if let Some(error) = &analysis.final_error {
                writeln!(out, "Error: {error}")?;
            }
            if let Some(kind) = &analysis.error_analysis {
                writeln!(out, "Type: {}", kind.error_type)?;
                writeln!(out, "Likely cause: {}", kind.likely_cause)?;
                writeln!(out, "Retryable: {}", if kind.is_retryable { "yes" } else { "no" })?;
            }
            writeln!(out, "Suggestions:")?;
            for suggestion in &analysis.suggestions {
                writeln!(out, "  - {suggestion}")?;
            }
        }
    }
    Ok(())
}

fn config(ctx: &Context, command: ConfigCommand, out: &mut dyn Write) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Show => {
            for (key, value) in ctx.config.get_all() {
                writeln!(out, "{key} = {value}")?;
            }
            writeln!(out)?;
            writeln!(out, "Rules:")?;
            for (key, rule) in validation_rules() {
                writeln!(out, "  {key}: {rule}")?;
            }
        }
        ConfigCommand::Get { key } => {
            let value = ctx.config.get(&key, Value::Null);
            if value.is_null() {
                bail!("config key not set: {key}");
            }
            writeln!(out, "{value}")?;
        }
        ConfigCommand::Set { key, value } => {
            let value = parse_cli_value(&value);
            let mut entries = Map::new();
            entries.insert(key.clone(), value.clone());
            ctx.config.update(entries)?;
            writeln!(out, "{key} = {value}")?;
        }
        ConfigCommand::Reset => {
            ctx.config.reset()?;
            writeln!(out, "Configuration reset to defaults")?;
        }
    }
    Ok(())
}
