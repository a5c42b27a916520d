use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// State carried through a graph execution.
///
/// Tasks never mutate the state directly: each one receives an owned snapshot and
/// returns an [`FlowState::Update`], which the graph applies once the task is done.
/// `apply` is the single place where an update can be rejected.
pub trait FlowState: Clone + Send + Sync + 'static {
    type Update: Send + 'static;

    fn apply(&mut self, task_id: &str, update: Self::Update) -> Result<()>;
}

/// Result of a task execution
#[derive(Debug, Clone)]
pub struct TaskResult<U> {
    /// Partial state update produced by the task
    pub update: U,
    /// Response to send to the user
    pub response: Option<String>,
    /// Next action to take
    pub next_action: NextAction,
    /// Short human-readable description of what the task did
    pub status_message: Option<String>,
    /// Filled in by the graph with the id of the task that produced this result
    pub task_id: String,
}

impl<U> TaskResult<U> {
    pub fn new(update: U, response: Option<String>, next_action: NextAction) -> Self {
        Self {
            update,
            response,
            next_action,
            status_message: None,
            task_id: String::new(),
        }
    }

    pub fn new_with_status(
        update: U,
        response: Option<String>,
        next_action: NextAction,
        status_message: Option<String>,
    ) -> Self {
        Self {
            update,
            response,
            next_action,
            status_message,
            task_id: String::new(),
        }
    }
}

/// Defines what should happen after a task completes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextAction {
    /// Move along the outgoing edge and execute the next task immediately
    ContinueAndExecute,
    /// Halt and wait for the caller to provide more input
    WaitForInput,
    /// End the graph execution
    End,
    /// Jump to a specific task by ID
    GoTo(String),
}

/// Core trait that all tasks must implement
#[async_trait]
pub trait Task<S: FlowState>: Send + Sync {
    /// Unique identifier for this task
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Execute the task against a snapshot of the state
    async fn run(&self, state: S) -> Result<TaskResult<S::Update>>;
}
