//! `workflow dispatch <file.yaml>` (spec.md §6): runs a workflow
//! non-interactively and prints its run id and final status as JSON,
//! for scripted callers that don't want the `run` command's live output.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use workflow_engine::{run_workflow, OverallStatus, WorkflowRunOptions};

use super::run::{load_workflow, parse_kv};
use super::utils;

#[derive(Args)]
pub struct DispatchArgs {
    /// Workflow YAML file to run
    pub workflow: PathBuf,

    /// Workflow parameter, `key=value`, repeatable
    #[arg(short = 'p', long = "param", value_parser = parse_kv)]
    pub param: Vec<(String, String)>,

    /// Fail the whole workflow as soon as any task fails
    #[arg(long, default_value_t = true)]
    pub stop_on_first_failure: bool,
}

#[derive(Serialize)]
struct DispatchResult {
    run_id: String,
    status: OverallStatus,
    duration_ms: i64,
    succeeded: usize,
    failed: usize,
    skipped: usize,
}

pub async fn execute(args: DispatchArgs) -> Result<ExitCode> {
    let workflow = match load_workflow(&args.workflow).await {
        Ok(w) => w,
        Err(e) => {
            utils::error(&format!("{e:#}"));
            return Ok(ExitCode::from(1));
        }
    };

    if let Err(e) = workflow.validate_structure() {
        utils::error(&format!("structural error: {e}"));
        return Ok(ExitCode::from(1));
    }

    let options = WorkflowRunOptions {
        parameters: args.param.into_iter().collect::<HashMap<_, _>>(),
        stop_on_first_failure: args.stop_on_first_failure,
        ..Default::default()
    };

    let ctx = run_workflow(
        workflow,
        std::env::vars().collect(),
        options,
        tokio_util::sync::CancellationToken::new(),
        None,
    )
    .await?;

    let results = ctx.results.snapshot();
    let succeeded = results.values().filter(|r| r.is_success()).count();
    let failed = results.values().filter(|r| r.is_failed()).count();
    let skipped = results.values().filter(|r| r.was_skipped()).count();
    let status = ctx.overall_status();

    let output = DispatchResult {
        run_id: ctx.run_id.clone(),
        status,
        duration_ms: (chrono::Utc::now() - ctx.start_time).num_milliseconds(),
        succeeded,
        failed,
        skipped,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    match status {
        OverallStatus::Succeeded => Ok(ExitCode::SUCCESS),
        OverallStatus::Cancelled => Ok(ExitCode::from(130)),
        OverallStatus::Failed | OverallStatus::Running => Ok(ExitCode::from(1)),
    }
}
