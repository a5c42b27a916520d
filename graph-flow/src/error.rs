use thiserror::Error;

/// Errors raised while building or executing a graph
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Graph has no start task")]
    MissingStartTask,

    #[error("Task execution failed: {0}")]
    TaskExecutionFailed(String),

    /// A task returned an update that does not fit the state it was applied to
    #[error("Task {task_id} violated its contract: {reason}")]
    ContractViolation { task_id: String, reason: String },

    /// The observer of an execution went away (e.g. the client disconnected)
    #[error("Execution observer closed")]
    ObserverClosed,

    #[error("Step limit of {0} exceeded")]
    StepLimitExceeded(usize),

    #[error("Storage error: {0}")]
    StorageError(String),
}

impl From<sqlx::Error> for GraphError {
    fn from(err: sqlx::Error) -> Self {
        GraphError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::StorageError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
