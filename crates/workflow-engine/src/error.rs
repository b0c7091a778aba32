//! Error types for the workflow execution kernel.

use thiserror::Error;

/// Result type alias for engine operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Main error type for the workflow engine.
///
/// Per spec.md §7, most failure classes here are never surfaced to a caller
/// as a thrown error — they are carried as a `TaskResult`/`WorkflowContext`
/// value instead. Only validation and programmer-error classes actually
/// propagate through `Result`.
#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    /// A task references a `DependsOn` id that does not exist in the workflow.
    #[error("unknown dependency: task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    /// The DAG scheduler could not place every regular task into a wave.
    #[error("circular dependency among tasks: {0:?}")]
    CircularDependency(Vec<String>),

    /// A task id is declared more than once.
    #[error("duplicate task id: {0}")]
    DuplicateTaskId(String),

    /// Workflow or task definition failed structural validation.
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// No execution strategy in the fixed priority order could handle a task.
    /// Programmer error (spec.md §7 `StrategyUnavailable`): the local
    /// strategy always matches, so this can only happen if it wasn't
    /// registered.
    #[error("no execution strategy available for task {0}")]
    StrategyUnavailable(String),

    /// A task's Docker or SSH override is present but not runnable (e.g.
    /// missing container name, or missing host/user).
    #[error("invalid remote execution config for task {0}: {1}")]
    InvalidRemoteConfig(String, String),

    /// Task not found in the result store or plan.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Retry requested while the task is still actively executing.
    #[error("task {0} cannot be retried while still running")]
    RetryWhileRunning(String),

    /// Serialization/deserialization of the workflow or trigger document failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Programmer-error class of failure (e.g. poisoned lock, invariant
    /// violation) that should never occur in correct code.
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// True for errors that are purely structural/programmer errors and
    /// should never be treated as a task-level retry candidate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkflowError::CircularDependency(_)
                | WorkflowError::UnknownDependency { .. }
                | WorkflowError::DuplicateTaskId(_)
                | WorkflowError::InvalidDefinition(_)
                | WorkflowError::StrategyUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for WorkflowError {
    fn from(err: serde_yaml::Error) -> Self {
        WorkflowError::Serialization(err.to_string())
    }
}
