//! Workflow runner: wave-by-wave concurrent orchestration with step-mode
//! pause, per-task cancel, event stream, and retry-after-the-fact (spec.md
//! §4.5).

use crate::dag;
use crate::error::{WorkflowError, WorkflowResult};
use crate::matrix;
use crate::model::{TaskId, Workflow};
use crate::process::ProgressSink;
use crate::state::{OverallStatus, TaskResult, TaskStatus, WorkflowContext};
use crate::strategy::{default_strategies, ExecutionStrategy};
use crate::task_executor::{self, is_output_event};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// Events emitted by the runner over the course of a run (spec.md §4.5).
#[derive(Debug, Clone)]
pub enum RunEvent {
    WorkflowStarted {
        total_tasks: usize,
    },
    WaveStarted {
        wave_index: usize,
    },
    TaskStarted {
        task_id: TaskId,
    },
    TaskOutput {
        task_id: TaskId,
        line: String,
        is_stderr: bool,
    },
    TaskCompleted {
        task_id: TaskId,
        result: TaskResult,
    },
    TaskSkipped {
        task_id: TaskId,
        result: TaskResult,
    },
    TaskCancelled {
        task_id: TaskId,
        result: TaskResult,
    },
    StepPaused {
        completed_task_id: Option<TaskId>,
        is_waiting_to_start: bool,
    },
    StepResumed,
    WaveCompleted {
        wave_index: usize,
    },
    WorkflowCompleted {
        status: OverallStatus,
        duration_ms: i64,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
}

pub type EventSink = mpsc::UnboundedSender<RunEvent>;

/// Step-mode gate: the UI implements this to pause/resume wave progression
/// one task at a time (spec.md §4.5 step-mode gate).
#[async_trait]
pub trait StepController: Send + Sync {
    async fn wait(&self, cancel: &CancellationToken);
}

/// Options accepted by `run_workflow` (spec.md §4.5).
pub struct WorkflowRunOptions {
    pub dry_run: bool,
    /// Overrides `workflow.max_parallelism` when set; `-1` means unlimited.
    pub max_parallelism: Option<i64>,
    pub additional_env: HashMap<String, String>,
    pub step_mode: bool,
    pub step_controller: Option<Arc<dyn StepController>>,
    pub show_commands: bool,
    pub parameters: HashMap<String, String>,
    /// Stop launching further regular waves once a non-continuable task
    /// fails; the terminal `AlwaysTasks` wave still runs (spec.md §4.5).
    pub stop_on_first_failure: bool,
    pub exponential_backoff: bool,
}

impl Default for WorkflowRunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_parallelism: None,
            additional_env: HashMap::new(),
            step_mode: false,
            step_controller: None,
            show_commands: false,
            parameters: HashMap::new(),
            stop_on_first_failure: true,
            exponential_backoff: false,
        }
    }
}

/// Permits effectively unbounded concurrency (`max_parallelism == -1`)
/// without special-casing every call site.
const UNBOUNDED_PERMITS: usize = 1 << 20;

fn resolve_max_parallelism(workflow: &Workflow, options: &WorkflowRunOptions) -> usize {
    let configured = options.max_parallelism.unwrap_or(workflow.max_parallelism);
    if configured < 0 {
        UNBOUNDED_PERMITS
    } else {
        configured.max(1) as usize
    }
}

fn expanded_workflow(workflow: &Workflow) -> Workflow {
    let mut expanded = workflow.clone();
    expanded.tasks = matrix::expand_matrices(workflow.tasks.clone());
    expanded
}

/// Runs `workflow` to completion (spec.md §4.5). `host_env` seeds the
/// *full* environment used for local execution.
pub async fn run_workflow(
    workflow: Workflow,
    host_env: HashMap<String, String>,
    options: WorkflowRunOptions,
    cancellation: CancellationToken,
    events: Option<EventSink>,
) -> WorkflowResult<Arc<WorkflowContext>> {
    let expanded = expanded_workflow(&workflow);
    let plan = dag::plan_workflow(&expanded)?;

    let ctx = Arc::new(build_context(
        expanded,
        host_env,
        &options,
        cancellation,
    ));

    emit(&events, RunEvent::WorkflowStarted {
        total_tasks: plan.total_tasks(),
    });

    if options.dry_run {
        for task in &ctx.workflow.tasks {
            ctx.results.set(TaskResult::skipped(task.id.clone(), "dry run"));
        }
        return Ok(ctx);
    }

    let strategies = Arc::new(default_strategies());
    let semaphore = Arc::new(Semaphore::new(resolve_max_parallelism(&ctx.workflow, &options)));

    if options.step_mode {
        emit(&events, RunEvent::StepPaused {
            completed_task_id: None,
            is_waiting_to_start: true,
        });
        if let Some(controller) = &options.step_controller {
            controller.wait(&ctx.cancellation).await;
        }
        emit(&events, RunEvent::StepResumed);
    }

    let mut stopped_early = false;
    for (wave_index, wave) in plan.waves.iter().enumerate() {
        if stopped_early {
            break;
        }
        run_wave(
            wave_index,
            wave,
            &ctx,
            &strategies,
            &semaphore,
            &options,
            &events,
        )
        .await;

        if wave_failed_without_continue(&ctx, wave) && options.stop_on_first_failure {
            stopped_early = true;
        }
    }

    if !plan.always_tasks.is_empty() {
        run_wave(
            plan.waves.len(),
            &plan.always_tasks,
            &ctx,
            &strategies,
            &semaphore,
            &options,
            &events,
        )
        .await;
    }

    let status = ctx.overall_status();
    let snapshot = ctx.results.snapshot();
    let succeeded = snapshot.values().filter(|r| r.is_success()).count();
    let failed = snapshot.values().filter(|r| r.is_failed()).count();
    let skipped = snapshot.values().filter(|r| r.was_skipped()).count();
    let duration_ms = (Utc::now() - ctx.start_time).num_milliseconds();

    emit(&events, RunEvent::WorkflowCompleted {
        status,
        duration_ms,
        succeeded,
        failed,
        skipped,
    });

    Ok(ctx)
}

fn build_context(
    expanded: Workflow,
    host_env: HashMap<String, String>,
    options: &WorkflowRunOptions,
    cancellation: CancellationToken,
) -> WorkflowContext {
    let mut ctx = WorkflowContext::new(
        Arc::new(expanded),
        host_env,
        options.additional_env.clone(),
        options.parameters.clone(),
        options.show_commands,
    );
    ctx.cancellation = cancellation;
    ctx
}

fn wave_failed_without_continue(ctx: &WorkflowContext, wave: &[TaskId]) -> bool {
    wave.iter().any(|id| {
        ctx.results
            .get(id)
            .map(|r| r.is_failed())
            .unwrap_or(false)
            && ctx
                .workflow
                .get_task(id)
                .map(|t| !t.continue_on_error)
                .unwrap_or(true)
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_wave(
    wave_index: usize,
    wave: &[TaskId],
    ctx: &Arc<WorkflowContext>,
    strategies: &Arc<Vec<Box<dyn ExecutionStrategy>>>,
    semaphore: &Arc<Semaphore>,
    options: &WorkflowRunOptions,
    events: &Option<EventSink>,
) {
    emit(events, RunEvent::WaveStarted { wave_index });

    let mut handles = Vec::with_capacity(wave.len());
    for task_id in wave {
        let Some(task) = ctx.workflow.get_task(task_id).cloned() else {
            continue;
        };
        let ctx = ctx.clone();
        let strategies = strategies.clone();
        let semaphore = semaphore.clone();
        let events = events.clone();
        let exponential_backoff = options.exponential_backoff;

        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            emit(&events, RunEvent::TaskStarted {
                task_id: task.id.clone(),
            });

            let cancel = ctx.task_cancellation.create_child(&task.id, &ctx.cancellation);
            let (tx, mut rx) = mpsc::unbounded_channel();
            let forward_events = events.clone();
            let forward_task_id = task.id.clone();
            let forward_handle = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Some((line, is_stderr)) = is_output_event(&event) {
                        emit(&forward_events, RunEvent::TaskOutput {
                            task_id: forward_task_id.clone(),
                            line: line.to_string(),
                            is_stderr,
                        });
                    }
                }
            });

            let sink: ProgressSink = tx;
            let result = task_executor::execute_task(
                &ctx,
                &task,
                &strategies,
                cancel,
                Some(sink),
                exponential_backoff,
            )
            .await;
            let _ = forward_handle.await;

            ctx.task_cancellation.remove(&task.id);
            ctx.results.set(result.clone());

            let event = match result.status {
                TaskStatus::Skipped => RunEvent::TaskSkipped {
                    task_id: task.id.clone(),
                    result,
                },
                TaskStatus::Cancelled => RunEvent::TaskCancelled {
                    task_id: task.id.clone(),
                    result,
                },
                _ => RunEvent::TaskCompleted {
                    task_id: task.id.clone(),
                    result,
                },
            };
            emit(&events, event);
        });
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.await;

        if options.step_mode {
            emit(events, RunEvent::StepPaused {
                completed_task_id: None,
                is_waiting_to_start: false,
            });
            if let Some(controller) = &options.step_controller {
                controller.wait(&ctx.cancellation).await;
            }
            emit(events, RunEvent::StepResumed);
        }
    }

    emit(events, RunEvent::WaveCompleted { wave_index });
}

fn emit(events: &Option<EventSink>, event: RunEvent) {
    if let Some(sink) = events {
        let _ = sink.send(event);
    }
}

/// Re-executes a single task whose current result is `Failed` or
/// `TimedOut`, updating the result store and emitting fresh task events
/// (spec.md §4.5 "Retry-after-the-fact"). Rejected while the task is still
/// actively executing.
pub struct TaskRetrier;

impl TaskRetrier {
    pub async fn retry_task(
        ctx: &Arc<WorkflowContext>,
        task_id: &str,
        events: Option<EventSink>,
        exponential_backoff: bool,
    ) -> WorkflowResult<TaskResult> {
        let task = ctx
            .workflow
            .get_task(task_id)
            .cloned()
            .ok_or_else(|| WorkflowError::TaskNotFound(task_id.to_string()))?;

        match ctx.results.get(task_id) {
            Some(r) if matches!(r.status, TaskStatus::Failed | TaskStatus::TimedOut) => {}
            Some(r) if r.status == TaskStatus::Running => {
                return Err(WorkflowError::RetryWhileRunning(task_id.to_string()))
            }
            None => {}
            _ => return Err(WorkflowError::RetryWhileRunning(task_id.to_string())),
        }

        let strategies = default_strategies();
        let cancel = ctx.task_cancellation.create_child(task_id, &ctx.cancellation);

        emit(&events, RunEvent::TaskStarted {
            task_id: task_id.to_string(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let forward_events = events.clone();
        let forward_task_id = task_id.to_string();
        let forward_handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some((line, is_stderr)) = is_output_event(&event) {
                    emit(&forward_events, RunEvent::TaskOutput {
                        task_id: forward_task_id.clone(),
                        line: line.to_string(),
                        is_stderr,
                    });
                }
            }
        });

        let result = task_executor::execute_task(
            ctx,
            &task,
            &strategies,
            cancel,
            Some(tx),
            exponential_backoff,
        )
        .await;
        let _ = forward_handle.await;

        ctx.task_cancellation.remove(task_id);
        ctx.results.set(result.clone());

        let event = match result.status {
            TaskStatus::Cancelled => RunEvent::TaskCancelled {
                task_id: task_id.to_string(),
                result: result.clone(),
            },
            _ => RunEvent::TaskCompleted {
                task_id: task_id.to_string(),
                result: result.clone(),
            },
        };
        emit(&events, event);

        Ok(result)
    }
}

/// Cancels one task's own source without affecting the rest of the workflow
/// (spec.md §5 `Cancel(task)`).
pub fn cancel_task(ctx: &WorkflowContext, task_id: &str) -> bool {
    ctx.task_cancellation.cancel(task_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskInput, TaskOutputConfig, WorkflowTask};

    fn task(id: &str, run: &str, depends_on: Vec<&str>) -> WorkflowTask {
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
            depends_on: depends_on.into_iter().map(|s| s.to_string()).collect(),
            matrix: None,
            docker: None,
            ssh: None,
            matrix_values: None,
        }
    }

    fn workflow(tasks: Vec<WorkflowTask>) -> Workflow {
        Workflow {
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
        }
    }

    #[tokio::test]
    async fn diamond_workflow_succeeds() {
        let wf = workflow(vec![
            task("a", "echo a", vec![]),
            task("b", "echo b", vec!["a"]),
            task("c", "echo c", vec!["a"]),
            task("d", "echo d", vec!["b", "c"]),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = run_workflow(
            wf,
            HashMap::new(),
            WorkflowRunOptions::default(),
            CancellationToken::new(),
            Some(tx),
        )
        .await
        .unwrap();
        assert_eq!(ctx.overall_status(), OverallStatus::Succeeded);
        assert_eq!(ctx.results.len(), 4);

        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            if let RunEvent::WorkflowCompleted { status, .. } = event {
                assert_eq!(status, OverallStatus::Succeeded);
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn dry_run_skips_every_task() {
        let wf = workflow(vec![task("a", "echo a", vec![])]);
        let ctx = run_workflow(
            wf,
            HashMap::new(),
            WorkflowRunOptions {
                dry_run: true,
                ..Default::default()
            },
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
        assert!(ctx.results.get("a").unwrap().was_skipped());
    }

    #[tokio::test]
    async fn failure_stops_later_waves_but_runs_always_tasks() {
        let wf = workflow(vec![
            task("a", "exit 1", vec![]),
            task("b", "echo b", vec!["a"]),
            {
                let mut cleanup = task("cleanup", "echo cleanup", vec![]);
                cleanup.condition = Some("${{ always() }}".to_string());
                cleanup
            },
        ]);
        let ctx = run_workflow(
            wf,
            HashMap::new(),
            WorkflowRunOptions::default(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
        assert!(ctx.results.get("a").unwrap().is_failed());
        assert!(ctx.results.get("b").is_none());
        assert!(ctx.results.get("cleanup").unwrap().is_success());
        assert_eq!(ctx.overall_status(), OverallStatus::Failed);
    }

    #[tokio::test]
    async fn retry_task_reruns_a_failed_task() {
        let wf = workflow(vec![task("a", "exit 1", vec![])]);
        let ctx = run_workflow(
            wf,
            HashMap::new(),
            WorkflowRunOptions::default(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
        assert!(ctx.results.get("a").unwrap().is_failed());

        let result = TaskRetrier::retry_task(&ctx, "a", None, false).await.unwrap();
        assert!(result.is_failed());
        assert!(ctx.results.get("a").unwrap().is_failed());
    }
}
