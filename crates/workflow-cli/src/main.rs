use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "workflow")]
#[command(version, about = "Declarative shell-task workflow engine", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Workflow YAML file to run when no subcommand is given
    workflow: Option<PathBuf>,

    #[command(flatten)]
    run_args: commands::run::RunArgs,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow file without running it
    Validate(commands::validate::ValidateArgs),
    /// Render a workflow's execution plan as ascii or dot
    Graph(commands::graph::GraphArgs),
    /// Manage durable cron schedules
    Schedule(commands::schedule::ScheduleArgs),
    /// Run the cron scheduler daemon
    Daemon(commands::daemon::DaemonArgs),
    /// Dispatch a workflow run immediately, bypassing schedules
    Dispatch(commands::dispatch::DispatchArgs),
    /// Manage and test trigger rules, or run the trigger ingress service
    Trigger(commands::trigger::TriggerArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        "info"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("workflow={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Some(Commands::Validate(args)) => commands::validate::execute(args).await,
        Some(Commands::Graph(args)) => commands::graph::execute(args).await,
        Some(Commands::Schedule(args)) => commands::schedule::execute(args).await,
        Some(Commands::Daemon(args)) => commands::daemon::execute(args).await,
        Some(Commands::Dispatch(args)) => commands::dispatch::execute(args).await,
        Some(Commands::Trigger(args)) => commands::trigger::execute(args).await,
        None => match cli.workflow {
            Some(path) => commands::run::execute(path, cli.run_args, cli.quiet).await,
            None => {
                commands::utils::error("a workflow file or subcommand is required");
                Ok(ExitCode::from(1))
            }
        },
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            if cli.verbose {
                commands::utils::error(&format!("{e:?}"));
            } else {
                commands::utils::error(&e.to_string());
            }
            ExitCode::from(1)
        }
    }
}
