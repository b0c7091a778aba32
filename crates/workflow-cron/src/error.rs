//! Error types for the cron scheduler daemon.

use thiserror::Error;

pub type CronResult<T> = Result<T, CronError>;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("invalid cron expression '{0}': {1}")]
    InvalidCronExpression(String, String),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(uuid::Uuid),

    #[error("schedule storage error: {0}")]
    Storage(String),

    #[error("workflow file error: {0}")]
    WorkflowFile(String),

    #[error("workflow engine error: {0}")]
    Engine(#[from] workflow_engine::WorkflowError),
}

impl From<std::io::Error> for CronError {
    fn from(err: std::io::Error) -> Self {
        CronError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CronError {
    fn from(err: serde_json::Error) -> Self {
        CronError::Storage(err.to_string())
    }
}

impl From<serde_yaml::Error> for CronError {
    fn from(err: serde_yaml::Error) -> Self {
        CronError::WorkflowFile(err.to_string())
    }
}
