//! `workflow graph <file.yaml>` (spec.md §6 supplement, SPEC_FULL.md): prints
//! the planned execution order either as an indented wave list or as a
//! Graphviz `dot` document of the task dependency graph.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, ValueEnum};
use console::style;

use workflow_engine::{expand_matrices, plan_workflow};

use super::run::load_workflow;
use super::utils;

#[derive(Clone, Copy, ValueEnum)]
pub enum GraphFormat {
    Ascii,
    Dot,
}

#[derive(Args)]
pub struct GraphArgs {
    /// Workflow YAML file to plan
    pub workflow: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value = "ascii")]
    pub format: GraphFormat,
}

pub async fn execute(args: GraphArgs) -> Result<ExitCode> {
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

    let plan = match plan_workflow(&workflow) {
        Ok(plan) => plan,
        Err(e) => {
            utils::error(&format!("scheduling error: {e}"));
            return Ok(ExitCode::from(1));
        }
    };

    match args.format {
        GraphFormat::Ascii => print_ascii(&workflow, &plan),
        GraphFormat::Dot => print_dot(&workflow, &plan),
    }

    Ok(ExitCode::SUCCESS)
}

fn print_ascii(workflow: &workflow_engine::Workflow, plan: &workflow_engine::ExecutionPlan) {
    println!("{} ({} tasks)", style(&workflow.name).bold(), plan.total_tasks());
    for (index, wave) in plan.waves.iter().enumerate() {
        println!("{}", style(format!("wave {index}")).cyan().bold());
        for task_id in wave {
            println!("  - {task_id}");
        }
    }
    if !plan.always_tasks.is_empty() {
        println!("{}", style("always()").yellow().bold());
        for task_id in &plan.always_tasks {
            println!("  - {task_id}");
        }
    }
}

fn print_dot(workflow: &workflow_engine::Workflow, plan: &workflow_engine::ExecutionPlan) {
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{}\" {{", workflow.name);
    let _ = writeln!(out, "  rankdir=LR;");
    for (index, wave) in plan.waves.iter().enumerate() {
        for task_id in wave {
            let _ = writeln!(out, "  \"{task_id}\" [label=\"{task_id}\\n(wave {index})\"];");
        }
    }
    for task_id in &plan.always_tasks {
        let _ = writeln!(out, "  \"{task_id}\" [label=\"{task_id}\\n(always)\", style=dashed];");
    }
    for task in &workflow.tasks {
        for dep in &task.depends_on {
            let _ = writeln!(out, "  \"{dep}\" -> \"{}\";", task.id);
        }
    }
    let _ = writeln!(out, "}}");
    print!("{out}");
}
