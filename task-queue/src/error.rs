use shared::types::TaskId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskQueueError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task queue is full")]
    QueueFull,

    #[error("completion for task {0} does not match its assignment")]
    StaleCompletion(TaskId),

    #[error("task {0} is not in a state that allows this transition")]
    InvalidTransition(TaskId),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no eligible node")]
    NoEligibleNode,
}

/// Failure modes of the inference boundary. Timeouts and rate limits are
/// transient and retried by the executor; the rest fail the task.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("inference request timed out")]
    Timeout,

    #[error("inference provider rate limited the request")]
    RateLimited,

    #[error("model {0} is not available")]
    InvalidModel(String),

    #[error("inference request failed: {0}")]
    Unknown(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Timeout | ProviderError::RateLimited)
    }
}
