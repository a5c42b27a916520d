//! Progress events for one consultation turn.
//!
//! Graph callbacks are turned into [`PipelineEvent`]s by [`EventSink`] and pushed into a
//! bounded channel that the HTTP layer drains into SSE frames. A closed channel means the
//! client went away, which surfaces to the graph as [`GraphError::ObserverClosed`].

use std::time::Duration;

use async_trait::async_trait;
use graph_flow::{FlowObserver, GraphError};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::{
    CaseStatus, ConversationState, Department, NextStep, RouteDecision, StageKey,
};
use crate::normalize::preview;

pub const STAGE_STARTED: &str = "已启动";
pub const STAGE_FINISHED: &str = "处理完成";
pub const REPLY_STARTED: &str = "开始逐 token 生成最终回复";
pub const REPLY_FINISHED: &str = "流式输出完成";
pub const REPLY_INTERRUPTED: &str = "流式中断，使用兜底回复";
pub const TURN_FAILED: &str = "工作流异常，请稍后重试。";

const PREVIEW_CHARS: usize = 80;
const TOKEN_CHUNK_CHARS: usize = 10;

/// What the client sees of the conversation after a turn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub session_id: String,
    pub next_action: NextStep,
    pub case_status: CaseStatus,
    /// Number of user turns so far
    pub followup_round: usize,
    pub route: Option<RouteDecision>,
    pub doc_count: usize,
}

impl StateSnapshot {
    pub fn of(session_id: &str, state: &ConversationState) -> Self {
        Self {
            session_id: session_id.to_string(),
            next_action: state.next_action,
            case_status: state.next_action.case_status(),
            followup_round: state.user_turns(),
            route: state.route.clone(),
            doc_count: state.documents.len(),
        }
    }
}

/// Result of a turn: the reply plus the snapshot it left behind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReply {
    pub session_id: String,
    pub assistant_reply: String,
    pub next_action: NextStep,
    pub snapshot: StateSnapshot,
}

impl TurnReply {
    pub fn of(session_id: &str, state: &ConversationState) -> Self {
        Self {
            session_id: session_id.to_string(),
            assistant_reply: state.assistant_reply.clone(),
            next_action: state.next_action,
            snapshot: StateSnapshot::of(session_id, state),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Meta {
        session_id: String,
        doc_count: usize,
    },
    StageStart {
        stage: StageKey,
        label: &'static str,
        message: String,
    },
    StageProgress {
        stage: StageKey,
        label: &'static str,
        message: String,
    },
    StageDone {
        stage: StageKey,
        label: &'static str,
        message: String,
        next_action: NextStep,
        #[serde(skip_serializing_if = "Option::is_none")]
        preview: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        department: Option<Department>,
    },
    Token {
        content: String,
    },
    Final(TurnReply),
    Error {
        message: String,
    },
    /// End of the event sequence
    Done,
}

impl PipelineEvent {
    pub fn stage_start(stage: StageKey, message: &str) -> Self {
        PipelineEvent::StageStart {
            stage,
            label: stage.label(),
            message: message.to_string(),
        }
    }

    pub fn stage_progress(stage: StageKey, message: impl Into<String>) -> Self {
        PipelineEvent::StageProgress {
            stage,
            label: stage.label(),
            message: message.into(),
        }
    }

    /// `stage_done` for a graph stage, read off the state the stage produced.
    pub fn stage_done(stage: StageKey, state: &ConversationState) -> Self {
        let reply_preview = preview(&state.assistant_reply, PREVIEW_CHARS);
        PipelineEvent::StageDone {
            stage,
            label: stage.label(),
            message: STAGE_FINISHED.to_string(),
            next_action: state.next_action,
            preview: (!reply_preview.is_empty()).then_some(reply_preview),
            department: match stage {
                StageKey::Router => Some(state.department()),
                _ => None,
            },
        }
    }

    pub fn reply_done() -> Self {
        PipelineEvent::StageDone {
            stage: StageKey::SummaryReply,
            label: StageKey::SummaryReply.label(),
            message: REPLY_FINISHED.to_string(),
            next_action: NextStep::Done,
            preview: None,
            department: None,
        }
    }

    pub fn token(content: impl Into<String>) -> Self {
        PipelineEvent::Token {
            content: content.into(),
        }
    }

    pub fn failed() -> Self {
        PipelineEvent::Error {
            message: TURN_FAILED.to_string(),
        }
    }
}

fn stage_tips(stage: StageKey) -> &'static [&'static str] {
    match stage {
        StageKey::Intake => &["正在整理主诉信息", "正在检查缺失字段", "正在生成补充提问"],
        StageKey::Router => &["正在判断分诊科室", "正在比对关键症状", "正在生成分诊理由"],
        StageKey::Specialist => &["正在进行专科分析", "正在整理检查建议", "正在评估风险提醒"],
        StageKey::SummaryStructured => &["正在整合结构化结论", "正在生成复诊与急症边界"],
        StageKey::SummaryReply => &["处理中"],
    }
}

/// Heartbeat text: a rotating tip plus the elapsed time, whole seconds rounded down.
pub fn progress_message(stage: StageKey, tick: u32, heartbeat: Duration) -> String {
    let tips = stage_tips(stage);
    let tip = tips[tick as usize % tips.len()];
    let elapsed = (heartbeat.as_secs_f64() * f64::from(tick.saturating_add(1))) as u64;
    format!("{tip} (约 {elapsed}s)")
}

/// Split text into chunks of at most `TOKEN_CHUNK_CHARS` characters.
pub fn chunk_text(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(TOKEN_CHUNK_CHARS)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Observer that forwards graph progress to the turn's event channel
pub struct EventSink {
    tx: mpsc::Sender<PipelineEvent>,
    heartbeat: Duration,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<PipelineEvent>, heartbeat: Duration) -> Self {
        Self { tx, heartbeat }
    }

    pub async fn send(&self, event: PipelineEvent) -> graph_flow::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| GraphError::ObserverClosed)
    }

    fn stage(task_id: &str) -> graph_flow::Result<StageKey> {
        task_id
            .parse()
            .map_err(|_| GraphError::TaskNotFound(task_id.to_string()))
    }
}

#[async_trait]
impl FlowObserver<ConversationState> for EventSink {
    async fn task_started(&mut self, task_id: &str) -> graph_flow::Result<()> {
        let stage = Self::stage(task_id)?;
        self.send(PipelineEvent::stage_start(stage, STAGE_STARTED))
            .await
    }

    async fn task_heartbeat(&mut self, task_id: &str, tick: u32) -> graph_flow::Result<()> {
        let stage = Self::stage(task_id)?;
        let message = progress_message(stage, tick, self.heartbeat);
        self.send(PipelineEvent::stage_progress(stage, message))
            .await
    }

    async fn task_finished(
        &mut self,
        task_id: &str,
        state: &ConversationState,
    ) -> graph_flow::Result<()> {
        let stage = Self::stage(task_id)?;
        self.send(PipelineEvent::stage_done(stage, state)).await
    }
}
