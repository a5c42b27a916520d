use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::{
    error::{GraphError, Result},
    observer::{FlowObserver, NoopObserver},
    storage::Session,
    task::{FlowState, NextAction, Task, TaskResult},
};

const DEFAULT_MAX_STEPS: usize = 64;

/// Edge between tasks in the graph
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// A graph of tasks that can be executed
pub struct Graph<S: FlowState> {
    pub id: String,
    tasks: HashMap<String, Arc<dyn Task<S>>>,
    edges: Vec<Edge>,
    start_task_id: Option<String>,
    max_steps: usize,
}

impl<S: FlowState> Graph<S> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tasks: HashMap::new(),
            edges: Vec::new(),
            start_task_id: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Execute the graph from its start task until it halts.
    pub async fn execute_session(&self, session: &mut Session<S>) -> Result<ExecutionResult> {
        self.execute_session_observed(session, None, &mut NoopObserver)
            .await
    }

    /// Execute the graph from its start task until a task asks for input or ends the run.
    ///
    /// Every task runs on a spawned tokio task against a snapshot of `session.state`; the
    /// returned update is applied to the session only after the task has finished. With a
    /// `heartbeat` period the observer is woken once per period while the task is running.
    ///
    /// If the observer fails the execution stops and the error is returned. A task that is
    /// still in flight at that point is left to finish in the background; its update is
    /// discarded.
    pub async fn execute_session_observed<O>(
        &self,
        session: &mut Session<S>,
        heartbeat: Option<Duration>,
        observer: &mut O,
    ) -> Result<ExecutionResult>
    where
        O: FlowObserver<S> + ?Sized,
    {
        let mut task_id = self
            .start_task_id
            .clone()
            .ok_or(GraphError::MissingStartTask)?;

        for _ in 0..self.max_steps {
            let task = self
                .get_task(&task_id)
                .ok_or_else(|| GraphError::TaskNotFound(task_id.clone()))?;

            debug!(graph_id = %self.id, session_id = %session.id, task_id = %task_id, "Executing task");
            observer.task_started(&task_id).await?;

            let snapshot = session.state.clone();
            let TaskResult {
                update,
                response,
                next_action,
                status_message,
                ..
            } = run_task(&task_id, task, snapshot, heartbeat, observer).await?;

            session.state.apply(&task_id, update)?;
            session.touch();
            observer.task_finished(&task_id, &session.state).await?;

            let status = match &next_action {
                NextAction::ContinueAndExecute => match self.find_next_task(&task_id) {
                    Some(next_task_id) => {
                        task_id = next_task_id;
                        continue;
                    }
                    // No outgoing edge: stay here and hand control back
                    None => ExecutionStatus::WaitingForInput,
                },
                NextAction::WaitForInput => ExecutionStatus::WaitingForInput,
                NextAction::End => ExecutionStatus::Completed,
                NextAction::GoTo(target_id) => {
                    if !self.tasks.contains_key(target_id) {
                        return Err(GraphError::TaskNotFound(target_id.clone()));
                    }
                    task_id = target_id.clone();
                    continue;
                }
            };

            return Ok(ExecutionResult {
                response,
                status,
                status_message,
                task_id,
            });
        }

        Err(GraphError::StepLimitExceeded(self.max_steps))
    }

    /// Find the next task based on edges
    pub fn find_next_task(&self, current_task_id: &str) -> Option<String> {
        self.edges
            .iter()
            .find(|edge| edge.from == current_task_id)
            .map(|edge| edge.to.clone())
    }

    /// Get the start task ID
    pub fn start_task_id(&self) -> Option<&str> {
        self.start_task_id.as_deref()
    }

    /// Get a task by ID
    pub fn get_task(&self, task_id: &str) -> Option<Arc<dyn Task<S>>> {
        self.tasks.get(task_id).cloned()
    }
}

async fn run_task<S, O>(
    task_id: &str,
    task: Arc<dyn Task<S>>,
    snapshot: S,
    heartbeat: Option<Duration>,
    observer: &mut O,
) -> Result<TaskResult<S::Update>>
where
    S: FlowState,
    O: FlowObserver<S> + ?Sized,
{
    let mut handle = tokio::spawn(async move { task.run(snapshot).await });

    let Some(period) = heartbeat else {
        return joined(task_id, handle.await);
    };

    // first beat one full period after the task starts
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick: u32 = 0;

    loop {
        tokio::select! {
            biased;
            outcome = &mut handle => return joined(task_id, outcome),
            _ = ticker.tick() => {
                observer.task_heartbeat(task_id, tick).await?;
                tick = tick.saturating_add(1);
            }
        }
    }
}

fn joined<U>(
    task_id: &str,
    outcome: std::result::Result<Result<TaskResult<U>>, JoinError>,
) -> Result<TaskResult<U>> {
    let mut result = outcome.map_err(|e| {
        GraphError::TaskExecutionFailed(format!("task {task_id} did not complete: {e}"))
    })??;
    result.task_id = task_id.to_string();
    Ok(result)
}

/// Builder for creating graphs
pub struct GraphBuilder<S: FlowState> {
    graph: Graph<S>,
}

impl<S: FlowState> GraphBuilder<S> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            graph: Graph::new(id),
        }
    }

    /// Add a task; the first task added becomes the start task
    pub fn add_task(mut self, task: Arc<dyn Task<S>>) -> Self {
        let task_id = task.id().to_string();
        if self.graph.tasks.is_empty() {
            self.graph.start_task_id = Some(task_id.clone());
        }
        self.graph.tasks.insert(task_id, task);
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.graph.edges.push(Edge {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn set_start_task(mut self, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        if self.graph.tasks.contains_key(&task_id) {
            self.graph.start_task_id = Some(task_id);
        }
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.graph.max_steps = max_steps;
        self
    }

    pub fn build(self) -> Graph<S> {
        self.graph
    }
}

/// Outcome of running a session until it halts
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub response: Option<String>,
    pub status: ExecutionStatus,
    pub status_message: Option<String>,
    /// The task that halted the execution
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Waiting for user input to continue
    WaitingForInput,
    /// Workflow completed successfully
    Completed,
}
