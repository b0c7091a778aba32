//! `workflow <file.yaml>` (spec.md §6 top-level surface): loads a workflow
//! document and runs it to completion, optionally pausing step-by-step or
//! re-running on file change via the same file-watch listener the trigger
//! ingress uses.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use workflow_engine::{
    run_workflow, OverallStatus, RunEvent, StepController, TaskStatus, Workflow,
    WorkflowRunOptions,
};
use workflow_triggers::listener::Listener;
use workflow_triggers::listeners::FileWatchListener;

use super::utils;

/// Shared run-time flags for the bare `<workflow.yaml>` invocation
/// (spec.md §6).
#[derive(Args, Clone)]
pub struct RunArgs {
    /// Plan and print the execution order without running any task
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Overrides `defaultTimeoutMs` for every task in the workflow
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Overrides the workflow's default working directory
    #[arg(short = 'C', long = "working-dir")]
    pub working_dir: Option<PathBuf>,

    /// Additional environment entries, `KEY=VALUE`, repeatable
    #[arg(short = 'e', long = "env", value_parser = parse_kv)]
    pub env: Vec<(String, String)>,

    /// Pause after each task completion until Enter is pressed
    #[arg(short = 's', long)]
    pub step: bool,

    /// Don't print each task's interpolated command before running it
    #[arg(long = "no-commands")]
    pub no_commands: bool,

    /// Workflow parameter, `key=value`, repeatable; resolved as `${{ params.key }}`
    #[arg(short = 'p', long = "param", value_parser = parse_kv)]
    pub param: Vec<(String, String)>,

    /// Re-run the workflow whenever a watched file changes
    #[arg(short = 'w', long)]
    pub watch: bool,

    /// Debounce window in milliseconds for `--watch` (overrides the workflow's `watch.debounceMs`)
    #[arg(long)]
    pub debounce: Option<u64>,

    /// Root directory to watch (overrides the workflow's `watch.paths`)
    #[arg(long = "watch-path")]
    pub watch_path: Option<PathBuf>,
}

pub fn parse_kv(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) => Ok((k.to_string(), v.to_string())),
        None => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

pub async fn load_workflow(path: &Path) -> Result<Workflow> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading workflow file {}", path.display()))?;
    let workflow: Workflow = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing workflow file {}", path.display()))?;
    Ok(workflow)
}

pub async fn execute(path: PathBuf, args: RunArgs, quiet: bool) -> Result<ExitCode> {
    let mut workflow = load_workflow(&path).await?;

    if let Err(e) = workflow.validate_structure() {
        utils::error(&format!("workflow validation failed: {e}"));
        return Ok(ExitCode::from(1));
    }

    if let Some(timeout) = args.timeout {
        workflow.default_timeout_ms = Some(timeout);
    }
    if let Some(dir) = &args.working_dir {
        workflow.working_directory = Some(dir.display().to_string());
    }

    if args.watch {
        run_with_watch(path, workflow, args, quiet).await
    } else {
        run_once(&workflow, &args, quiet).await
    }
}

async fn run_once(workflow: &Workflow, args: &RunArgs, quiet: bool) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    let signal_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let print_handle = tokio::spawn(print_events(rx, quiet));

    let options = WorkflowRunOptions {
        dry_run: args.dry_run,
        max_parallelism: None,
        additional_env: args.env.iter().cloned().collect::<HashMap<_, _>>(),
        step_mode: args.step,
        step_controller: if args.step {
            Some(Arc::new(EnterKeyController) as Arc<dyn StepController>)
        } else {
            None
        },
        show_commands: !args.no_commands,
        parameters: args.param.iter().cloned().collect::<HashMap<_, _>>(),
        stop_on_first_failure: true,
        exponential_backoff: false,
    };

    let host_env: HashMap<String, String> = std::env::vars().collect();
    let ctx = run_workflow(workflow.clone(), host_env, options, cancel, Some(tx)).await?;
    signal_handle.abort();
    let _ = print_handle.await;

    match ctx.overall_status() {
        OverallStatus::Succeeded => Ok(ExitCode::SUCCESS),
        OverallStatus::Cancelled => Ok(ExitCode::from(130)),
        OverallStatus::Failed | OverallStatus::Running => Ok(ExitCode::from(1)),
    }
}

async fn run_with_watch(
    path: PathBuf,
    mut workflow: Workflow,
    args: RunArgs,
    quiet: bool,
) -> Result<ExitCode> {
    let watch_cfg = workflow.watch.clone();
    let root = args
        .watch_path
        .clone()
        .or_else(|| watch_cfg.as_ref().and_then(|w| w.paths.first().map(PathBuf::from)))
        .unwrap_or_else(|| {
            path.parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."))
        });
    let include = watch_cfg.as_ref().map(|w| w.include.clone()).unwrap_or_default();
    let exclude = watch_cfg.as_ref().map(|w| w.exclude.clone()).unwrap_or_default();
    let debounce_ms = args
        .debounce
        .or_else(|| watch_cfg.as_ref().map(|w| w.debounce_ms))
        .unwrap_or(500);

    utils::info(&format!(
        "watching {} for changes (debounce {debounce_ms}ms, ctrl-c to stop)",
        root.display()
    ));

    let listener = Arc::new(FileWatchListener::new(
        root,
        &include,
        &exclude,
        Duration::from_millis(debounce_ms),
    ));
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel(16);
    let listener_for_start = listener.clone();
    let listener_cancel = cancel.clone();
    let start_handle = tokio::spawn(async move {
        let _ = listener_for_start.start(tx, listener_cancel).await;
    });

    let _ = run_once(&workflow, &args, quiet).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => {
                match message {
                    Some(_) => {
                        utils::info("change detected, re-running workflow");
                        match load_workflow(&path).await {
                            Ok(reloaded) => {
                                workflow = reloaded;
                                let _ = run_once(&workflow, &args, quiet).await;
                            }
                            Err(e) => utils::error(&format!("failed to reload workflow: {e}")),
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = listener.stop().await;
    let _ = start_handle.await;
    Ok(ExitCode::from(130))
}

/// Waits for a newline on stdin, honouring cancellation (spec.md §4.5
/// step-mode gate: the runner's `StepController`).
struct EnterKeyController;

#[async_trait]
impl StepController for EnterKeyController {
    async fn wait(&self, cancel: &CancellationToken) {
        println!("{}", style("-- paused, press Enter to continue --").dim());
        let mut reader = BufReader::new(tokio::io::stdin());
        let mut line = String::new();
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = reader.read_line(&mut line) => {}
        }
    }
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<RunEvent>, quiet: bool) {
    while let Some(event) = rx.recv().await {
        if quiet {
            continue;
        }
        match event {
            RunEvent::WorkflowStarted { total_tasks } => {
                utils::info(&format!("starting workflow ({total_tasks} tasks)"));
            }
            RunEvent::WaveStarted { wave_index } => {
                println!("{}", style(format!("wave {wave_index}")).bold().cyan());
            }
            RunEvent::TaskStarted { task_id } => {
                println!("  {} {task_id}", style("->").cyan());
            }
            RunEvent::TaskOutput { task_id, line, is_stderr } => {
                let prefix = if is_stderr { style("stderr").red() } else { style("stdout").dim() };
                println!("  [{task_id}] {prefix} {line}");
            }
            RunEvent::TaskCompleted { task_id, result } => {
                let (glyph, colored) = match result.status {
                    TaskStatus::Succeeded => ("✓", style(task_id.clone()).green()),
                    _ => ("✗", style(task_id.clone()).red()),
                };
                println!("  {glyph} {colored} ({}ms)", result.duration().map(|d| d.num_milliseconds()).unwrap_or(0));
                if let Some(msg) = &result.error_message {
                    println!("    {}", style(msg).red());
                }
            }
            RunEvent::TaskSkipped { task_id, result } => {
                println!(
                    "  {} {} — {}",
                    style("○").yellow(),
                    style(task_id).yellow(),
                    result.error_message.unwrap_or_default()
                );
            }
            RunEvent::TaskCancelled { task_id, .. } => {
                println!("  {} {}", style("⊘").yellow(), style(task_id).yellow());
            }
            RunEvent::StepPaused { .. } | RunEvent::StepResumed => {}
            RunEvent::WaveCompleted { .. } => {}
            RunEvent::WorkflowCompleted { status, duration_ms, succeeded, failed, skipped } => {
                let status_styled = match status {
                    OverallStatus::Succeeded => style(format!("{status:?}")).green().bold(),
                    OverallStatus::Cancelled => style(format!("{status:?}")).yellow().bold(),
                    _ => style(format!("{status:?}")).red().bold(),
                };
                println!();
                println!(
                    "{status_styled} in {duration_ms}ms — {succeeded} succeeded, {failed} failed, {skipped} skipped"
                );
            }
        }
    }
}
