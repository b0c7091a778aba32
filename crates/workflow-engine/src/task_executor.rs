//! Task executor: runs exactly one task end-to-end, returning a
//! `TaskResult` (spec.md §4.4).

use crate::expr::{self, ExprContext};
use crate::input;
use crate::model::{TaskInput, WorkflowTask};
use crate::process::{self, ProcessEvent, ProcessRequest, ProcessStatus, ProgressSink};
use crate::retry::{run_with_retry, RetryConfig};
use crate::state::{TaskOutput, TaskResult, TaskStatus, WorkflowContext};
use crate::strategy::{self, effective_docker, ExecutionStrategy};
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Global floor applied to a task's effective timeout (spec.md §4.4 step 6:
/// "a global default floor").
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(3600);

fn build_condition_context<'a>(
    ctx: &'a WorkflowContext,
    task: &WorkflowTask,
    env: &'a HashMap<String, String>,
    dep_results: &'a HashMap<String, TaskResult>,
) -> ExprContext<'a> {
    ExprContext {
        env,
        tasks: dep_results,
        workflow_name: ctx.workflow.id(),
        run_id: &ctx.run_id,
        params: &ctx.parameters,
        matrix: None,
        cancelled: ctx.is_cancelled(),
    }
}

/// Restricts the result store snapshot to a task's own `DependsOn` (spec.md
/// §4.3: "with no list, success()/failure() use the caller's own DependsOn").
fn dependency_results(ctx: &WorkflowContext, task: &WorkflowTask) -> HashMap<String, TaskResult> {
    task.depends_on
        .iter()
        .filter_map(|dep| ctx.results.get(dep).map(|r| (dep.clone(), r)))
        .collect()
}

/// Step 1: gate. Returns `Some(skip_reason)` when the task should be skipped.
fn gate(ctx: &WorkflowContext, task: &WorkflowTask, env: &HashMap<String, String>) -> Option<String> {
    let deps = dependency_results(ctx, task);
    let cond_ctx = build_condition_context(ctx, task, env, &deps);

    if let Some(condition) = &task.condition {
        if !expr::evaluate_condition(condition, &cond_ctx) {
            return Some(format!("condition '{condition}' evaluated to false"));
        }
        return None;
    }

    if !task.depends_on.is_empty() {
        let all_succeeded = task.depends_on.iter().all(|dep| {
            ctx.results
                .get(dep)
                .map(|r| r.is_success())
                .unwrap_or(false)
        });
        if !all_succeeded {
            return Some("one or more dependencies did not succeed".to_string());
        }
    }
    None
}

fn effective_timeout(ctx: &WorkflowContext, task: &WorkflowTask) -> Duration {
    task.timeout_ms
        .or(ctx.workflow.default_timeout_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TASK_TIMEOUT)
}

fn retry_config(task: &WorkflowTask, exponential: bool) -> RetryConfig {
    RetryConfig {
        max_retries: task.retry_count,
        delay_ms: task.retry_delay_ms,
        exponential,
    }
}

/// Runs `task` to completion (spec.md §4.4). `progress` receives line-level
/// process events for the UI/event stream; `exponential_backoff` controls
/// the retry policy's delay growth (workflow-level setting, not in the task
/// model itself).
pub async fn execute_task(
    ctx: &WorkflowContext,
    task: &WorkflowTask,
    strategies: &[Box<dyn ExecutionStrategy>],
    cancel: CancellationToken,
    progress: Option<ProgressSink>,
    exponential_backoff: bool,
) -> TaskResult {
    let start_time = Utc::now();

    // Step 2: choose env and interpolate the command (spec.md §4.4 step 2).
    let use_declared_env = effective_docker(&ctx.workflow, task).is_some_and(|c| c.is_valid());
    let env = if use_declared_env {
        ctx.declared_environment.clone()
    } else {
        ctx.environment.clone()
    };

    let deps = dependency_results(ctx, task);

    // Step 1: gate.
    if let Some(reason) = gate(ctx, task, &env) {
        return TaskResult::skipped(task.id.clone(), reason);
    }

    if cancel.is_cancelled() {
        return TaskResult::cancelled(task.id.clone(), None, start_time);
    }

    let interp_ctx = build_condition_context(ctx, task, &env, &deps);
    let interpolated_cmd = expr::interpolate(&task.run, &interp_ctx);

    // Step 3: resolve stdin bytes.
    let stdin = input::resolve_input(&task.input, &interp_ctx).await;

    // Step 4: select execution strategy.
    let strategy = match strategy::select_strategy(strategies, &ctx.workflow, task) {
        Ok(s) => s,
        Err(e) => {
            return TaskResult::failed(
                task.id.clone(),
                -1,
                TaskOutput::empty(),
                e.to_string(),
                start_time,
            )
        }
    };
    let config = match strategy.build_config(&interpolated_cmd, &ctx.workflow, task, &env) {
        Ok(c) => c,
        Err(e) => {
            return TaskResult::failed(
                task.id.clone(),
                -1,
                TaskOutput::empty(),
                e.to_string(),
                start_time,
            )
        }
    };

    let timeout = effective_timeout(ctx, task);
    let retry = retry_config(task, exponential_backoff);

    // Step 5/6: run with retries, each attempt under its own cancellation
    // scope linked to the caller's token plus a fresh timeout (spec.md §5).
    let result = run_with_retry(
        &retry,
        |attempt, max_retries| {
            tracing::warn!(
                task_id = %task.id,
                attempt,
                max_retries,
                "task failed, retrying"
            );
        },
        |_attempt| {
            let config = config.clone();
            let stdin = stdin.clone();
            let cancel = cancel.clone();
            let progress = progress.clone();
            let task_id = task.id.clone();
            let max_size_bytes = task.output.max_size_bytes;
            let capture_stderr = task.output.capture_stderr;
            async move {
                let outcome = process::run_process(
                    ProcessRequest {
                        config,
                        stdin,
                        timeout,
                        max_size_bytes,
                        capture_stderr,
                    },
                    cancel,
                    progress.as_ref(),
                )
                .await;
                map_outcome(task_id, outcome, start_time)
            }
        },
    )
    .await;

    result
}

fn map_outcome(
    task_id: crate::model::TaskId,
    outcome: process::ProcessOutcome,
    start_time: chrono::DateTime<Utc>,
) -> TaskResult {
    match outcome.status {
        ProcessStatus::Succeeded => {
            TaskResult::succeeded(task_id, outcome.exit_code, outcome.output, start_time)
        }
        ProcessStatus::Failed => TaskResult::failed(
            task_id,
            outcome.exit_code,
            outcome.output,
            outcome.error_message.unwrap_or_else(|| "task failed".to_string()),
            start_time,
        ),
        ProcessStatus::TimedOut => TaskResult::timed_out(task_id, outcome.output, start_time),
        ProcessStatus::Cancelled => {
            TaskResult::cancelled(task_id, Some(outcome.output), start_time)
        }
    }
}

/// Forwards raw process events to the caller's progress sink as
/// `TaskOutputEvent`-shaped data; kept here so the runner doesn't need to
/// know about `ProcessEvent` directly.
pub fn is_output_event(event: &ProcessEvent) -> Option<(&str, bool)> {
    match event {
        ProcessEvent::StdOut(line) => Some((line.as_str(), false)),
        ProcessEvent::StdErr(line) => Some((line.as_str(), true)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskOutputConfig, Workflow};
    use crate::strategy::default_strategies;
    use std::sync::Arc;

    fn workflow(tasks: Vec<WorkflowTask>) -> Arc<Workflow> {
        Arc::new(Workflow {
            name: "w".into(),
            description: None,
            environment: HashMap::new(),
            working_directory: None,
            default_timeout_ms: None,
            max_parallelism: -1,
            shell: None,
            docker: None,
            ssh: None,
            watch: None,
            webhooks: None,
            tasks,
        })
    }

    fn task(id: &str, run: &str) -> WorkflowTask {
        WorkflowTask {
            id: id.to_string(),
            run: run.to_string(),
            name: None,
            shell: None,
            working_directory: None,
            environment: HashMap::new(),
            condition: None,
            input: TaskInput::None,
            output: TaskOutputConfig::default(),
            timeout_ms: Some(5000),
            continue_on_error: false,
            retry_count: 0,
            retry_delay_ms: 0,
            depends_on: vec![],
            matrix: None,
            docker: None,
            ssh: None,
            matrix_values: None,
        }
    }

    #[tokio::test]
    async fn successful_task_returns_success() {
        let wf = workflow(vec![task("a", "echo hi")]);
        let ctx = WorkflowContext::new(wf.clone(), HashMap::new(), HashMap::new(), HashMap::new(), false);
        let result = execute_task(
            &ctx,
            &wf.tasks[0],
            &default_strategies(),
            CancellationToken::new(),
            None,
            false,
        )
        .await;
        assert!(result.is_success());
        assert!(result.output.unwrap().stdout.contains("hi"));
    }

    #[tokio::test]
    async fn condition_false_skips_task() {
        let mut t = task("a", "echo hi");
        t.condition = Some("'false'".to_string());
        let wf = workflow(vec![t]);
        let ctx = WorkflowContext::new(wf.clone(), HashMap::new(), HashMap::new(), HashMap::new(), false);
        let result = execute_task(
            &ctx,
            &wf.tasks[0],
            &default_strategies(),
            CancellationToken::new(),
            None,
            false,
        )
        .await;
        assert!(result.was_skipped());
    }

    #[tokio::test]
    async fn unsatisfied_dependency_skips_task() {
        let mut dependent = task("b", "echo hi");
        dependent.depends_on = vec!["a".to_string()];
        let wf = workflow(vec![task("a", "exit 1"), dependent]);
        let ctx = WorkflowContext::new(wf.clone(), HashMap::new(), HashMap::new(), HashMap::new(), false);
        ctx.results.set(TaskResult::failed(
            "a".into(),
            1,
            TaskOutput::empty(),
            "boom",
            Utc::now(),
        ));
        let result = execute_task(
            &ctx,
            &wf.tasks[1],
            &default_strategies(),
            CancellationToken::new(),
            None,
            false,
        )
        .await;
        assert!(result.was_skipped());
    }

    #[tokio::test]
    async fn retry_succeeds_eventually() {
        let mut t = task(
            "a",
            "test -f /tmp/workflow-engine-test-marker && echo ok || (touch /tmp/workflow-engine-test-marker && exit 1)",
        );
        t.retry_count = 2;
        t.retry_delay_ms = 1;
        let _ = std::fs::remove_file("/tmp/workflow-engine-test-marker");
        let wf = workflow(vec![t]);
        let ctx = WorkflowContext::new(wf.clone(), HashMap::new(), HashMap::new(), HashMap::new(), false);
        let result = execute_task(
            &ctx,
            &wf.tasks[0],
            &default_strategies(),
            CancellationToken::new(),
            None,
            false,
        )
        .await;
        assert!(result.is_success());
        let _ = std::fs::remove_file("/tmp/workflow-engine-test-marker");
    }

    #[tokio::test]
    async fn timeout_preserves_partial_output() {
        let mut t = task("a", "echo partial; sleep 10");
        t.timeout_ms = Some(200);
        let wf = workflow(vec![t]);
        let ctx = WorkflowContext::new(wf.clone(), HashMap::new(), HashMap::new(), HashMap::new(), false);
        let result = execute_task(
            &ctx,
            &wf.tasks[0],
            &default_strategies(),
            CancellationToken::new(),
            None,
            false,
        )
        .await;
        assert_eq!(result.status, TaskStatus::TimedOut);
        assert!(result.output.unwrap().stdout.contains("partial"));
    }
}
