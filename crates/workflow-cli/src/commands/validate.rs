//! `workflow validate <file.yaml>` (spec.md §6): structural validation plus
//! matrix expansion and DAG planning, without running anything.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use workflow_engine::{expand_matrices, plan_workflow};

use super::run::load_workflow;
use super::utils;

#[derive(Args)]
pub struct ValidateArgs {
    /// Workflow YAML file to validate
    pub workflow: PathBuf,
}

pub async fn execute(args: ValidateArgs) -> Result<ExitCode> {
    let mut workflow = match load_workflow(&args.workflow).await {
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

    workflow.tasks = expand_matrices(workflow.tasks.clone());

    match plan_workflow(&workflow) {
        Ok(plan) => {
            utils::success(&format!(
                "{} is valid: {} task(s) across {} wave(s), {} always() task(s)",
                workflow.name,
                plan.total_tasks(),
                plan.waves.len(),
                plan.always_tasks.len(),
            ));
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            utils::error(&format!("scheduling error: {e}"));
            Ok(ExitCode::from(1))
        }
    }
}
