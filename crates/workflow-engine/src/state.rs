//! Per-run state: task results, variables, cancellation, and the
//! `WorkflowContext` that threads through the runner and task executor
//! (spec.md §3, §5).

use crate::model::{TaskId, Workflow};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Status of a single task's execution (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
    TimedOut,
}

/// Captured stdout/stderr/bytes/file output for a task (spec.md §4.4 step 6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutput {
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub truncated: bool,
}

impl TaskOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_stdout(stdout: String) -> Self {
        Self {
            stdout,
            ..Default::default()
        }
    }

    pub fn stdout_string(&self) -> String {
        self.stdout.clone()
    }
}

/// Outcome of running one task (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// -1 when the process never ran (skipped, cancelled before spawn, ...).
    pub exit_code: i32,
    pub output: Option<TaskOutput>,
    pub error_message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn pending(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            exit_code: -1,
            output: None,
            error_message: None,
            start_time: None,
            end_time: None,
        }
    }

    pub fn skipped(task_id: TaskId, reason: impl Into<String>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Skipped,
            exit_code: -1,
            output: None,
            error_message: Some(reason.into()),
            start_time: None,
            end_time: Some(Utc::now()),
        }
    }

    pub fn succeeded(
        task_id: TaskId,
        exit_code: i32,
        output: TaskOutput,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            status: TaskStatus::Succeeded,
            exit_code,
            output: Some(output),
            error_message: None,
            start_time: Some(start_time),
            end_time: Some(Utc::now()),
        }
    }

    pub fn failed(
        task_id: TaskId,
        exit_code: i32,
        output: TaskOutput,
        error_message: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            exit_code,
            output: Some(output),
            error_message: Some(error_message.into()),
            start_time: Some(start_time),
            end_time: Some(Utc::now()),
        }
    }

    pub fn timed_out(task_id: TaskId, output: TaskOutput, start_time: DateTime<Utc>) -> Self {
        Self {
            task_id,
            status: TaskStatus::TimedOut,
            exit_code: -1,
            output: Some(output),
            error_message: Some("task timed out".to_string()),
            start_time: Some(start_time),
            end_time: Some(Utc::now()),
        }
    }

    pub fn cancelled(task_id: TaskId, output: Option<TaskOutput>, start_time: DateTime<Utc>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Cancelled,
            exit_code: -1,
            output,
            error_message: Some("task cancelled".to_string()),
            start_time: Some(start_time),
            end_time: Some(Utc::now()),
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(s), Some(e)) => Some(e.signed_duration_since(s)),
            _ => None,
        }
    }

    /// Succeeded AND exit code 0 (spec.md §3).
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded && self.exit_code == 0
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Failed | TaskStatus::TimedOut | TaskStatus::Cancelled
        )
    }

    pub fn was_skipped(&self) -> bool {
        self.status == TaskStatus::Skipped
    }
}

/// Append-only (per key) concurrent map of task results (spec.md §3 invariants).
#[derive(Clone, Default)]
pub struct TaskResultStore {
    inner: Arc<DashMap<TaskId, TaskResult>>,
}

impl TaskResultStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Insert a result, or overwrite in place (retry case — spec.md §3:
    /// "retry updates in place").
    pub fn set(&self, result: TaskResult) {
        self.inner.insert(result.task_id.clone(), result);
    }

    pub fn get(&self, task_id: &str) -> Option<TaskResult> {
        self.inner.get(task_id).map(|r| r.clone())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.inner.contains_key(task_id)
    }

    pub fn snapshot(&self) -> HashMap<TaskId, TaskResult> {
        self.inner
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Concurrent key/value store for task-to-task variable passing.
#[derive(Clone, Default)]
pub struct VariableStore {
    inner: Arc<DashMap<String, String>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).map(|v| v.clone())
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.inner
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

/// Per-task cancellation tokens, linked to the run's root token
/// (spec.md §5). Entries are removed on task completion.
#[derive(Clone, Default)]
pub struct TaskCancellationManager {
    inner: Arc<DashMap<TaskId, CancellationToken>>,
}

impl TaskCancellationManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Creates (or replaces) a child token of `root` for `task_id`.
    pub fn create_child(&self, task_id: &str, root: &CancellationToken) -> CancellationToken {
        let token = root.child_token();
        self.inner.insert(task_id.to_string(), token.clone());
        token
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        if let Some(token) = self.inner.get(task_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub fn remove(&self, task_id: &str) {
        self.inner.remove(task_id);
    }
}

/// Workflow-level status, derived monotonically as tasks complete
/// (spec.md §3, §4.5 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Per-run mutable state created at run start (spec.md §3).
#[derive(Clone)]
pub struct WorkflowContext {
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub workflow: Arc<Workflow>,
    /// Host + workflow + task + CLI, used for local execution.
    pub environment: HashMap<String, String>,
    /// Workflow + task + CLI only, used for container execution.
    pub declared_environment: HashMap<String, String>,
    pub cancellation: CancellationToken,
    pub parameters: HashMap<String, String>,
    pub show_commands: bool,
    pub results: TaskResultStore,
    pub variables: VariableStore,
    pub task_cancellation: TaskCancellationManager,
    cancelled_flag: Arc<AtomicBool>,
}

impl WorkflowContext {
    pub fn new(
        workflow: Arc<Workflow>,
        host_env: HashMap<String, String>,
        additional_env: HashMap<String, String>,
        parameters: HashMap<String, String>,
        show_commands: bool,
    ) -> Self {
        let mut declared_environment = workflow.environment.clone();
        declared_environment.extend(additional_env.clone());

        let mut environment = host_env;
        environment.extend(declared_environment.clone());

        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            start_time: Utc::now(),
            workflow,
            environment,
            declared_environment,
            cancellation: CancellationToken::new(),
            parameters,
            show_commands,
            results: TaskResultStore::new(),
            variables: VariableStore::new(),
            task_cancellation: TaskCancellationManager::new(),
            cancelled_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled_flag.load(Ordering::SeqCst) || self.cancellation.is_cancelled()
    }

    /// Cancels the root token (spec.md §5: `Cancel(workflow)`).
    pub fn cancel(&self) {
        self.cancelled_flag.store(true, Ordering::SeqCst);
        self.cancellation.cancel();
    }

    /// `Status = Succeeded` iff every task is `IsSuccess ∨ WasSkipped ∨
    /// ContinueOnError` (spec.md §8).
    pub fn overall_status(&self) -> OverallStatus {
        if self.is_cancelled() {
            return OverallStatus::Cancelled;
        }
        let snapshot = self.results.snapshot();
        for task in &self.workflow.tasks {
            if let Some(result) = snapshot.get(&task.id) {
                if result.is_failed() && !task.continue_on_error {
                    return OverallStatus::Failed;
                }
            }
        }
        OverallStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Workflow, WorkflowTask};

    fn task(id: &str, continue_on_error: bool) -> WorkflowTask {
        WorkflowTask {
            id: id.to_string(),
            run: "true".to_string(),
            name: None,
            shell: None,
            working_directory: None,
            environment: HashMap::new(),
            condition: None,
            input: Default::default(),
            output: Default::default(),
            timeout_ms: None,
            continue_on_error,
            retry_count: 0,
            retry_delay_ms: 0,
            depends_on: vec![],
            matrix: None,
            docker: None,
            ssh: None,
            matrix_values: None,
        }
    }

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

    #[test]
    fn result_store_overwrites_in_place_on_retry() {
        let store = TaskResultStore::new();
        store.set(TaskResult::failed(
            "a".into(),
            1,
            TaskOutput::empty(),
            "boom",
            Utc::now(),
        ));
        assert_eq!(store.len(), 1);
        store.set(TaskResult::succeeded(
            "a".into(),
            0,
            TaskOutput::empty(),
            Utc::now(),
        ));
        assert_eq!(store.len(), 1);
        assert!(store.get("a").unwrap().is_success());
    }

    #[test]
    fn overall_status_succeeds_when_failure_has_continue_on_error() {
        let ctx = WorkflowContext::new(
            workflow(vec![task("a", true)]),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            false,
        );
        ctx.results.set(TaskResult::failed(
            "a".into(),
            1,
            TaskOutput::empty(),
            "boom",
            Utc::now(),
        ));
        assert_eq!(ctx.overall_status(), OverallStatus::Succeeded);
    }

    #[test]
    fn overall_status_fails_without_continue_on_error() {
        let ctx = WorkflowContext::new(
            workflow(vec![task("a", false)]),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            false,
        );
        ctx.results.set(TaskResult::failed(
            "a".into(),
            1,
            TaskOutput::empty(),
            "boom",
            Utc::now(),
        ));
        assert_eq!(ctx.overall_status(), OverallStatus::Failed);
    }

    #[test]
    fn cancellation_propagates_to_overall_status() {
        let ctx = WorkflowContext::new(
            workflow(vec![task("a", false)]),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            false,
        );
        ctx.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.overall_status(), OverallStatus::Cancelled);
    }

    #[test]
    fn declared_environment_excludes_host_env() {
        let mut host = HashMap::new();
        host.insert("HOST_ONLY".to_string(), "1".to_string());
        let ctx = WorkflowContext::new(
            workflow(vec![]),
            host,
            HashMap::new(),
            HashMap::new(),
            false,
        );
        assert!(!ctx.declared_environment.contains_key("HOST_ONLY"));
        assert!(ctx.environment.contains_key("HOST_ONLY"));
    }
}
