//! `workflow daemon run` (spec.md §4.6, §6): runs the cron scheduler
//! daemon in the foreground until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Subcommand};

use workflow_cron::{CronDaemon, JsonFileScheduleStorage, SchedulerEvent};

use super::utils;

#[derive(Args)]
pub struct DaemonArgs {
    #[command(subcommand)]
    pub command: DaemonCommand,
}

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Start the scheduler and block until ctrl-c
    Run(RunArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the schedule store
    #[arg(long, env = "WORKFLOW_SCHEDULE_DB", default_value = "schedules.json")]
    pub db: PathBuf,

    /// Grace period to let in-flight runs finish on shutdown
    #[arg(long, default_value_t = 30)]
    pub grace_period_secs: u64,
}

pub async fn execute(args: DaemonArgs) -> Result<ExitCode> {
    match args.command {
        DaemonCommand::Run(run_args) => run(run_args).await,
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let storage = Arc::new(JsonFileScheduleStorage::new(args.db.clone()));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let daemon = Arc::new(CronDaemon::new(storage, Some(tx)).await?);

    let event_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SchedulerEvent::ScheduledRunTriggered { schedule_id, workflow_path, is_manual } => {
                    utils::info(&format!(
                        "schedule {schedule_id} firing {workflow_path} ({})",
                        if is_manual { "manual" } else { "cron" }
                    ));
                }
                SchedulerEvent::ScheduledRunCompleted { schedule_id, status, duration_ms, error_message } => {
                    match error_message {
                        None => utils::success(&format!(
                            "schedule {schedule_id} completed in {duration_ms}ms ({status:?})"
                        )),
                        Some(e) => utils::error(&format!("schedule {schedule_id} failed: {e}")),
                    }
                }
            }
        }
    });

    utils::info(&format!("cron daemon started, store: {}", args.db.display()));
    daemon.start().await;

    tokio::signal::ctrl_c().await?;
    utils::info("shutting down, waiting for in-flight runs");
    daemon.stop(Duration::from_secs(args.grace_period_secs)).await;
    event_task.abort();

    Ok(ExitCode::from(130))
}
