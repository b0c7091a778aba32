//! Error types for trigger ingress.

use thiserror::Error;

pub type TriggerResult<T> = Result<T, TriggerError>;

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("listener '{0}' failed to connect: {1}")]
    Connect(String, String),

    #[error("listener '{0}' transport error: {1}")]
    Transport(String, String),

    #[error("invalid pattern rule '{0}': {1}")]
    InvalidPattern(String, String),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] workflow_engine::WorkflowError),

    #[error("workflow file error: {0}")]
    WorkflowFile(String),

    #[error("rule not found: {0}")]
    RuleNotFound(String),
}

impl From<std::io::Error> for TriggerError {
    fn from(err: std::io::Error) -> Self {
        TriggerError::WorkflowFile(err.to_string())
    }
}

impl From<serde_yaml::Error> for TriggerError {
    fn from(err: serde_yaml::Error) -> Self {
        TriggerError::WorkflowFile(err.to_string())
    }
}
