//! Callbacks for watching a graph execution while it runs.
//!
//! [`Graph::execute_session_observed`](crate::Graph::execute_session_observed) runs every
//! task on its own tokio task and, while that task is outstanding, wakes up once per
//! heartbeat period to notify the observer. The order per task is always
//! `task_started`, zero or more `task_heartbeat`, then `task_finished`.

use async_trait::async_trait;

use crate::{error::Result, task::FlowState};

#[async_trait]
pub trait FlowObserver<S: FlowState>: Send {
    async fn task_started(&mut self, _task_id: &str) -> Result<()> {
        Ok(())
    }

    /// Called once per heartbeat period while the task is still running.
    /// `tick` starts at zero for every task.
    async fn task_heartbeat(&mut self, _task_id: &str, _tick: u32) -> Result<()> {
        Ok(())
    }

    /// Called after the task's update has been applied to `state`.
    async fn task_finished(&mut self, _task_id: &str, _state: &S) -> Result<()> {
        Ok(())
    }
}

/// Observer that ignores every callback
pub struct NoopObserver;

#[async_trait]
impl<S: FlowState> FlowObserver<S> for NoopObserver {}
