//! `workflow schedule <subcommand>` (spec.md §4.6, §6): manage the durable
//! cron schedule store without running the daemon.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use workflow_cron::{CronDaemon, JsonFileScheduleStorage, Schedule, ScheduleFilter, ScheduleId};

use super::utils;

#[derive(Args)]
pub struct ScheduleArgs {
    /// Path to the schedule store (one JSON file, created on first write)
    #[arg(long, env = "WORKFLOW_SCHEDULE_DB", default_value = "schedules.json")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: ScheduleCommand,
}

#[derive(Subcommand)]
pub enum ScheduleCommand {
    /// Add a new schedule
    Add(AddArgs),
    /// Remove a schedule
    Remove(IdArgs),
    /// List schedules
    List(ListArgs),
    /// Enable a schedule
    Enable(IdArgs),
    /// Disable a schedule
    Disable(IdArgs),
    /// Trigger a schedule immediately, bypassing its cron timer
    Trigger(IdArgs),
    /// Show a single schedule's details
    Show(IdArgs),
}

#[derive(Args)]
pub struct AddArgs {
    /// Human-readable schedule name
    pub name: String,
    /// 5-field UNIX cron expression
    pub cron_expr: String,
    /// Workflow YAML file this schedule runs
    pub workflow_path: PathBuf,
    /// Parameter, `key=value`, repeatable
    #[arg(short = 'p', long = "param", value_parser = super::run::parse_kv)]
    pub param: Vec<(String, String)>,
}

#[derive(Args)]
pub struct IdArgs {
    /// Schedule id (uuid)
    pub id: ScheduleId,
}

#[derive(Args)]
pub struct ListArgs {
    /// Only list enabled schedules
    #[arg(long)]
    pub enabled_only: bool,
    /// Filter by substring of the name
    #[arg(long)]
    pub name_contains: Option<String>,
}

#[derive(Tabled)]
struct ScheduleRow {
    id: String,
    name: String,
    cron: String,
    workflow: String,
    enabled: bool,
    next_run: String,
}

impl From<&Schedule> for ScheduleRow {
    fn from(s: &Schedule) -> Self {
        Self {
            id: s.id.to_string(),
            name: s.name.clone(),
            cron: s.cron_expr.clone(),
            workflow: s.workflow_path.clone(),
            enabled: s.enabled,
            next_run: s
                .next_run_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

async fn open_daemon(db: &PathBuf) -> Result<Arc<CronDaemon>> {
    let storage = Arc::new(JsonFileScheduleStorage::new(db.clone()));
    Ok(Arc::new(CronDaemon::new(storage, None).await?))
}

pub async fn execute(args: ScheduleArgs) -> Result<ExitCode> {
    let daemon = open_daemon(&args.db).await?;

    match args.command {
        ScheduleCommand::Add(add) => {
            let mut schedule = Schedule::new(add.name, add.cron_expr, add.workflow_path.display().to_string());
            schedule.input_parameters = add.param.into_iter().collect();
            match daemon.add_schedule(schedule).await {
                Ok(id) => {
                    utils::success(&format!("added schedule {id}"));
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    utils::error(&e.to_string());
                    Ok(ExitCode::from(1))
                }
            }
        }
        ScheduleCommand::Remove(args) => match daemon.remove_schedule(args.id).await {
            Ok(()) => {
                utils::success(&format!("removed schedule {}", args.id));
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                utils::error(&e.to_string());
                Ok(ExitCode::from(1))
            }
        },
        ScheduleCommand::List(list) => {
            let filter = ScheduleFilter {
                enabled_only: list.enabled_only,
                name_contains: list.name_contains,
            };
            let schedules = daemon.list_schedules(&filter).await;
            if schedules.is_empty() {
                utils::info("no schedules match");
            } else {
                let rows: Vec<ScheduleRow> = schedules.iter().map(ScheduleRow::from).collect();
                let mut table = Table::new(rows);
                table.with(Style::rounded());
                println!("{table}");
            }
            Ok(ExitCode::SUCCESS)
        }
        ScheduleCommand::Enable(args) => toggle(&daemon, args.id, true).await,
        ScheduleCommand::Disable(args) => toggle(&daemon, args.id, false).await,
        ScheduleCommand::Trigger(args) => match daemon.trigger_schedule(args.id).await {
            Ok(run_id) => {
                utils::success(&format!("triggered, run id {run_id}"));
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                utils::error(&e.to_string());
                Ok(ExitCode::from(1))
            }
        },
        ScheduleCommand::Show(args) => match daemon.get_schedule(args.id).await {
            Some(schedule) => {
                println!("{}", serde_json::to_string_pretty(&schedule)?);
                Ok(ExitCode::SUCCESS)
            }
            None => {
                utils::error(&format!("no such schedule: {}", args.id));
                Ok(ExitCode::from(1))
            }
        },
    }
}

async fn toggle(daemon: &Arc<CronDaemon>, id: ScheduleId, enabled: bool) -> Result<ExitCode> {
    let result = if enabled {
        daemon.enable_schedule(id).await
    } else {
        daemon.disable_schedule(id).await
    };
    match result {
        Ok(()) => {
            utils::success(&format!("schedule {id} {}", if enabled { "enabled" } else { "disabled" }));
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            utils::error(&e.to_string());
            Ok(ExitCode::from(1))
        }
    }
}
