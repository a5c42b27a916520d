use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use graph_flow::{
    ExecutionStatus, Graph, GraphBuilder, GraphError, Session, SessionStorage, Task,
};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tracing::{Instrument, error, info, info_span, warn};

use crate::llm::ModelClient;
use crate::models::{ConversationState, DocumentRecord, StageKey};
use crate::policy::ClinicalPolicy;
use crate::streaming::{
    EventSink, PipelineEvent, REPLY_INTERRUPTED, REPLY_STARTED, TURN_FAILED, TurnReply,
    chunk_text,
};
use crate::tasks::{IntakeStage, RouterStage, SpecialistStage, SummaryStage};

const EVENT_BUFFER: usize = 64;
const FALLBACK_TOKEN_DELAY: Duration = Duration::from_millis(10);
const PARTIAL_REPLY_CAVEAT: &str = "（回复生成中断，以下为根据结构化结果整理的完整总结）";

/// A turn that could not produce a reply. The message is safe to show to the client.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TurnFailed(pub String);

pub fn build_consultation_graph(
    model: Arc<dyn ModelClient>,
    policy: Arc<ClinicalPolicy>,
    summary: Arc<SummaryStage>,
) -> Graph<ConversationState> {
    let intake = Arc::new(IntakeStage::new(model.clone()));
    let intake_id = intake.id().to_string();

    let router = Arc::new(RouterStage::new(model.clone(), policy.clone()));
    let router_id = router.id().to_string();

    let specialist = Arc::new(SpecialistStage::new(model, policy));
    let specialist_id = specialist.id().to_string();

    let summary_id = summary.id().to_string();

    GraphBuilder::new("medical_consultation")
        .add_task(intake)
        .add_task(router)
        .add_task(specialist)
        .add_task(summary)
        .add_edge(&intake_id, &router_id)
        .add_edge(&router_id, &specialist_id)
        .add_edge(&specialist_id, &summary_id)
        .build()
}

/// Runs consultation turns against stored sessions.
///
/// One turn per session at a time: every turn, upload and reset takes the session's
/// own lock, so different sessions never wait on each other. The session is saved
/// only when a turn halts normally.
pub struct ConsultationPipeline {
    graph: Graph<ConversationState>,
    summary: Arc<SummaryStage>,
    storage: Arc<dyn SessionStorage<ConversationState>>,
    turn_locks: DashMap<String, Arc<Mutex<()>>>,
    heartbeat: Duration,
}

impl ConsultationPipeline {
    pub fn new(
        model: Arc<dyn ModelClient>,
        policy: Arc<ClinicalPolicy>,
        storage: Arc<dyn SessionStorage<ConversationState>>,
        heartbeat: Duration,
    ) -> Self {
        let summary = Arc::new(SummaryStage::new(model.clone(), policy.clone()));
        let graph = build_consultation_graph(model, policy, summary.clone());

        Self {
            graph,
            summary,
            storage,
            turn_locks: DashMap::new(),
            heartbeat,
        }
    }

    async fn lock_turn(&self, session_id: &str) -> TurnGuard<'_> {
        let lock = self
            .turn_locks
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let guard = lock.clone().lock_owned().await;

        TurnGuard {
            locks: &self.turn_locks,
            session_id: session_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    /// Start a turn in the background and return its event stream. The stream always
    /// ends with [`PipelineEvent::Done`] unless the receiver is dropped first.
    pub fn stream_turn(
        self: &Arc<Self>,
        session_id: &str,
        user_input: &str,
    ) -> mpsc::Receiver<PipelineEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let pipeline = Arc::clone(self);
        let session_id = session_id.to_string();
        let user_input = user_input.to_string();
        let span = info_span!("consultation_turn", session_id = %session_id);

        tokio::spawn(
            async move {
                let mut sink = EventSink::new(tx, pipeline.heartbeat);
                match pipeline
                    .execute_turn(&session_id, &user_input, &mut sink)
                    .await
                {
                    Ok(()) => {}
                    Err(GraphError::ObserverClosed) => {
                        info!("Client went away, turn abandoned");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "Consultation turn failed");
                        if sink.send(PipelineEvent::failed()).await.is_err() {
                            return;
                        }
                    }
                }
                // the receiver may already be gone after `final`
                let _ = sink.send(PipelineEvent::Done).await;
            }
            .instrument(span),
        );

        rx
    }

    /// Run a turn to completion and return the final reply.
    pub async fn run_turn(
        self: &Arc<Self>,
        session_id: &str,
        user_input: &str,
    ) -> Result<TurnReply, TurnFailed> {
        let mut events = self.stream_turn(session_id, user_input);
        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::Final(reply) => return Ok(reply),
                PipelineEvent::Error { message } => return Err(TurnFailed(message)),
                _ => {}
            }
        }
        Err(TurnFailed(TURN_FAILED.to_string()))
    }

    async fn execute_turn(
        &self,
        session_id: &str,
        user_input: &str,
        sink: &mut EventSink,
    ) -> graph_flow::Result<()> {
        let _turn = self.lock_turn(session_id).await;

        let mut session = self.storage.get_or_create(session_id).await?;
        session.state.begin_turn(user_input);
        info!(
            turn = session.state.user_turns(),
            documents = session.state.documents.len(),
            "Turn started"
        );

        sink.send(PipelineEvent::Meta {
            session_id: session_id.to_string(),
            doc_count: session.state.documents.len(),
        })
        .await?;

        let result = self
            .graph
            .execute_session_observed(&mut session, Some(self.heartbeat), sink)
            .await?;

        if result.status == ExecutionStatus::Completed {
            self.reply_phase(&mut session.state, sink).await?;
        }

        info!(
            next_action = ?session.state.next_action,
            halted_at = %result.task_id,
            "Turn finished"
        );

        let reply = TurnReply::of(session_id, &session.state);
        self.save(session).await?;
        sink.send(PipelineEvent::Final(reply)).await
    }

    /// Stream the patient-facing reply, falling back to the deterministic rendering.
    async fn reply_phase(
        &self,
        state: &mut ConversationState,
        sink: &EventSink,
    ) -> graph_flow::Result<()> {
        let stage = StageKey::SummaryReply;
        sink.send(PipelineEvent::stage_start(stage, REPLY_STARTED))
            .await?;

        let mut reply = String::new();
        let mut interrupted = false;

        match self.summary.stream_reply(state).await {
            Ok(mut fragments) => {
                while let Some(fragment) = fragments.next().await {
                    match fragment {
                        Ok(fragment) if fragment.is_empty() => {}
                        Ok(fragment) => {
                            reply.push_str(&fragment);
                            sink.send(PipelineEvent::token(fragment)).await?;
                        }
                        Err(e) => {
                            warn!(error = %e, streamed_chars = reply.chars().count(), "Reply stream aborted");
                            interrupted = true;
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Reply stream could not be opened");
                interrupted = true;
            }
        }

        if interrupted {
            sink.send(PipelineEvent::stage_progress(stage, REPLY_INTERRUPTED))
                .await?;
        }

        if reply.trim().is_empty() {
            reply.clear();
            let fallback = self.summary.fallback_reply(state);
            emit_chunked(&fallback, &mut reply, sink).await?;
        } else if interrupted {
            let fallback = self.summary.fallback_reply(state);
            let addition = format!("\n\n{PARTIAL_REPLY_CAVEAT}\n\n{fallback}");
            emit_chunked(&addition, &mut reply, sink).await?;
        }

        sink.send(PipelineEvent::reply_done()).await?;
        state.finish_reply(reply);
        Ok(())
    }

    /// Append extracted documents to a session; returns the session's document count.
    pub async fn attach_documents(
        &self,
        session_id: &str,
        records: Vec<DocumentRecord>,
    ) -> graph_flow::Result<usize> {
        let _turn = self.lock_turn(session_id).await;

        let mut session = self.storage.get_or_create(session_id).await?;
        session.state.documents.extend(records);
        let total = session.state.documents.len();
        self.save(session).await?;

        info!(session_id = %session_id, total_documents = total, "Documents attached");
        Ok(total)
    }

    /// The `final` payload for the stored state, or `None` for an unknown session.
    pub async fn snapshot(&self, session_id: &str) -> graph_flow::Result<Option<TurnReply>> {
        Ok(self
            .storage
            .get(session_id)
            .await?
            .map(|session| TurnReply::of(session_id, &session.state)))
    }

    pub async fn reset(&self, session_id: &str) -> graph_flow::Result<()> {
        let _turn = self.lock_turn(session_id).await;

        self.storage.delete(session_id).await?;
        info!(session_id = %session_id, "Session reset");
        Ok(())
    }

    async fn save(&self, mut session: Session<ConversationState>) -> graph_flow::Result<()> {
        session.touch();
        self.storage.save(session).await
    }
}

/// Holds a session's turn lock. On release the map entry is dropped unless another
/// caller is already waiting on the same lock.
struct TurnGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    session_id: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // the map and this guard are the only holders when nobody else is queued
        self.locks.remove_if(&self.session_id, |_, held| {
            Arc::ptr_eq(held, &self.lock) && Arc::strong_count(held) == 2
        });
    }
}

async fn emit_chunked(text: &str, reply: &mut String, sink: &EventSink) -> graph_flow::Result<()> {
    for chunk in chunk_text(text) {
        reply.push_str(&chunk);
        sink.send(PipelineEvent::token(chunk)).await?;
        tokio::time::sleep(FALLBACK_TOKEN_DELAY).await;
    }
    Ok(())
}
