//! Workflow execution kernel: a declarative YAML-driven DAG task runner.
//!
//! This crate owns the parts of the system specified as the execution
//! kernel: the DAG scheduler, the matrix expander, the `${{ }}` expression
//! engine, the task executor pipeline (condition gate, input resolution,
//! execution strategy, process supervision, retry), and the workflow
//! runner that ties them together wave by wave. Parsing workflow YAML into
//! the [`model::Workflow`] data model, the CLI, and the cron/trigger
//! subsystems live in sibling crates.

pub mod dag;
pub mod error;
pub mod expr;
pub mod input;
pub mod matrix;
pub mod model;
pub mod process;
pub mod retry;
pub mod runner;
pub mod state;
pub mod strategy;
pub mod task_executor;

pub use dag::{plan_workflow, ExecutionPlan, Wave};
pub use error::{WorkflowError, WorkflowResult};
pub use matrix::expand_matrices;
pub use model::{
    DockerConfig, MatrixConfig, OutputKind, SshConfig, TaskId, TaskInput, TaskOutputConfig,
    WatchConfig, Workflow, WorkflowTask,
};
pub use retry::RetryConfig;
pub use runner::{run_workflow, RunEvent, StepController, TaskRetrier, WorkflowRunOptions};
pub use state::{
    OverallStatus, TaskCancellationManager, TaskOutput, TaskResult, TaskResultStore, TaskStatus,
    VariableStore, WorkflowContext,
};
pub use strategy::{default_strategies, ExecutionStrategy};
