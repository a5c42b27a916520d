//! Typed task graphs for multi-stage LLM workflows.
//!
//! A [`Graph`] holds tasks that all operate on one [`FlowState`]. A task gets an owned
//! snapshot of the state, returns a partial update plus a [`NextAction`], and the graph
//! applies the update before deciding where to go next. Sessions keep the state between
//! calls through a [`SessionStorage`].

pub mod error;
pub mod graph;
pub mod observer;
pub mod storage;
pub mod task;

// Re-export commonly used types
pub use error::{GraphError, Result};
pub use graph::{ExecutionResult, ExecutionStatus, Graph, GraphBuilder};
pub use observer::{FlowObserver, NoopObserver};
pub use storage::{InMemorySessionStorage, PostgresSessionStorage, Session, SessionStorage};
pub use task::{FlowState, NextAction, Task, TaskResult};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    struct Counter {
        log: Vec<String>,
        total: i64,
    }

    impl FlowState for Counter {
        type Update = i64;

        fn apply(&mut self, task_id: &str, update: i64) -> Result<()> {
            if update < 0 {
                return Err(GraphError::ContractViolation {
                    task_id: task_id.to_string(),
                    reason: "negative increment".to_string(),
                });
            }
            self.log.push(task_id.to_string());
            self.total += update;
            Ok(())
        }
    }

    struct AddTask {
        id: &'static str,
        amount: i64,
        next: NextAction,
        delay: Duration,
    }

    impl AddTask {
        fn new(id: &'static str, amount: i64, next: NextAction) -> Arc<Self> {
            Arc::new(Self {
                id,
                amount,
                next,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Task<Counter> for AddTask {
        fn id(&self) -> &str {
            self.id
        }

        async fn run(&self, state: Counter) -> Result<TaskResult<i64>> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(TaskResult::new(
                self.amount,
                Some(format!("{} saw {}", self.id, state.total)),
                self.next.clone(),
            ))
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    #[async_trait]
    impl FlowObserver<Counter> for Recorder {
        async fn task_started(&mut self, task_id: &str) -> Result<()> {
            self.events.push(format!("start:{task_id}"));
            Ok(())
        }

        async fn task_heartbeat(&mut self, task_id: &str, tick: u32) -> Result<()> {
            self.events.push(format!("beat:{task_id}:{tick}"));
            Ok(())
        }

        async fn task_finished(&mut self, task_id: &str, state: &Counter) -> Result<()> {
            self.events.push(format!("done:{task_id}:{}", state.total));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_continue_and_execute_runs_until_end() {
        let graph = GraphBuilder::new("chain")
            .add_task(AddTask::new("a", 1, NextAction::ContinueAndExecute))
            .add_task(AddTask::new("b", 10, NextAction::ContinueAndExecute))
            .add_task(AddTask::new("c", 100, NextAction::End))
            .add_edge("a", "b")
            .add_edge("b", "c")
            .build();

        let mut session = Session::new("s1", Counter::default());
        let result = graph.execute_session(&mut session).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.task_id, "c");
        // each task sees the updates of the ones before it
        assert_eq!(result.response.as_deref(), Some("c saw 11"));
        assert_eq!(session.state.total, 111);
        assert_eq!(session.state.log, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_wait_for_input_halts_the_run() {
        let graph = GraphBuilder::new("halting")
            .add_task(AddTask::new("ask", 1, NextAction::WaitForInput))
            .add_task(AddTask::new("never", 5, NextAction::End))
            .add_edge("ask", "never")
            .build();

        let mut session = Session::new("s1", Counter::default());
        let result = graph.execute_session(&mut session).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::WaitingForInput);
        assert_eq!(session.state.log, vec!["ask"]);
    }

    #[tokio::test]
    async fn test_goto_and_missing_target() {
        let graph = GraphBuilder::new("jump")
            .add_task(AddTask::new("start", 1, NextAction::GoTo("end".into())))
            .add_task(AddTask::new("skipped", 1, NextAction::End))
            .add_task(AddTask::new("end", 2, NextAction::End))
            .add_edge("start", "skipped")
            .build();

        let mut session = Session::new("s1", Counter::default());
        graph.execute_session(&mut session).await.unwrap();
        assert_eq!(session.state.log, vec!["start", "end"]);

        let broken = GraphBuilder::new("broken")
            .add_task(AddTask::new("start", 1, NextAction::GoTo("nowhere".into())))
            .build();
        let mut session = Session::new("s2", Counter::default());
        let err = broken.execute_session(&mut session).await.unwrap_err();
        assert!(matches!(err, GraphError::TaskNotFound(id) if id == "nowhere"));
    }

    #[tokio::test]
    async fn test_goto_cycle_hits_step_limit() {
        let graph = GraphBuilder::new("loop")
            .add_task(AddTask::new("spin", 0, NextAction::GoTo("spin".into())))
            .max_steps(5)
            .build();

        let mut session = Session::new("s1", Counter::default());
        let err = graph.execute_session(&mut session).await.unwrap_err();
        assert!(matches!(err, GraphError::StepLimitExceeded(5)));
    }

    #[tokio::test]
    async fn test_rejected_update_is_not_applied() {
        let graph = GraphBuilder::new("reject")
            .add_task(AddTask::new("ok", 3, NextAction::ContinueAndExecute))
            .add_task(AddTask::new("bad", -1, NextAction::End))
            .add_edge("ok", "bad")
            .build();

        let mut session = Session::new("s1", Counter::default());
        let err = graph.execute_session(&mut session).await.unwrap_err();

        assert!(matches!(err, GraphError::ContractViolation { .. }));
        assert_eq!(session.state.total, 3);
    }

    #[tokio::test]
    async fn test_empty_graph_has_no_start_task() {
        let graph: Graph<Counter> = GraphBuilder::new("empty").build();
        let mut session = Session::new("s1", Counter::default());
        let err = graph.execute_session(&mut session).await.unwrap_err();
        assert!(matches!(err, GraphError::MissingStartTask));
    }

    #[tokio::test]
    async fn test_observer_sees_heartbeats_in_order() {
        let slow = Arc::new(AddTask {
            id: "slow",
            amount: 2,
            next: NextAction::ContinueAndExecute,
            delay: Duration::from_millis(60),
        });
        let graph = GraphBuilder::new("observed")
            .add_task(slow)
            .add_task(AddTask::new("fast", 1, NextAction::End))
            .add_edge("slow", "fast")
            .build();

        let mut session = Session::new("s1", Counter::default());
        let mut recorder = Recorder::default();
        graph
            .execute_session_observed(&mut session, Some(Duration::from_millis(10)), &mut recorder)
            .await
            .unwrap();

        let events = recorder.events;
        assert_eq!(events.first().map(String::as_str), Some("start:slow"));
        assert!(events.contains(&"beat:slow:0".to_string()));
        assert!(events.contains(&"beat:slow:1".to_string()));

        let slow_done = events.iter().position(|e| e == "done:slow:2").unwrap();
        let fast_start = events.iter().position(|e| e == "start:fast").unwrap();
        assert!(slow_done < fast_start);
        assert!(
            events[..slow_done]
                .iter()
                .all(|e| e.starts_with("start:slow") || e.starts_with("beat:slow"))
        );
        assert_eq!(events.last().map(String::as_str), Some("done:fast:3"));
    }

    #[tokio::test]
    async fn test_failing_observer_aborts_without_applying() {
        struct Closed;

        #[async_trait]
        impl FlowObserver<Counter> for Closed {
            async fn task_heartbeat(&mut self, _task_id: &str, _tick: u32) -> Result<()> {
                Err(GraphError::ObserverClosed)
            }
        }

        let slow = Arc::new(AddTask {
            id: "slow",
            amount: 7,
            next: NextAction::End,
            delay: Duration::from_millis(50),
        });
        let graph = GraphBuilder::new("closed").add_task(slow).build();

        let mut session = Session::new("s1", Counter::default());
        let err = graph
            .execute_session_observed(&mut session, Some(Duration::from_millis(5)), &mut Closed)
            .await
            .unwrap_err();

        assert!(matches!(err, GraphError::ObserverClosed));
        assert_eq!(session.state.total, 0);
    }

    #[tokio::test]
    async fn test_in_memory_storage() {
        let storage = InMemorySessionStorage::<Counter>::new();

        let fresh = storage.get_or_create("session1").await.unwrap();
        assert_eq!(fresh.state.total, 0);
        // get_or_create does not persist
        assert!(storage.get("session1").await.unwrap().is_none());

        let mut session = fresh;
        session.state.total = 42;
        storage.save(session).await.unwrap();

        let loaded = storage.get_or_create("session1").await.unwrap();
        assert_eq!(loaded.state.total, 42);
        assert!(storage.get("session2").await.unwrap().is_none());

        storage.delete("session1").await.unwrap();
        assert!(storage.get("session1").await.unwrap().is_none());
    }
}
