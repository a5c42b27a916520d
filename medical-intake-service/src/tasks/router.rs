use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{NextAction, Result, Task, TaskResult};
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::prompts;
use crate::llm::{CallOptions, ModelClient};
use crate::models::{
    ConversationState, ConversationTurn, Department, NextStep, PatientRecord, RouteDecision,
    StageKey, StateUpdate,
};
use crate::normalize::{
    append_marker, build_document_context, clamp_confidence, has_documents, safe_text,
    to_str_list,
};
use crate::policy::ClinicalPolicy;

pub const FALLBACK_REASON: &str = "模型分诊结果不稳定，已使用规则兜底。";
const DEFAULT_REASON: &str = "依据主要症状与病程信息进行分诊。";
const MAX_EVIDENCE: usize = 8;

/// Picks one of the four departments, falling back to keyword rules
pub struct RouterStage {
    model: Arc<dyn ModelClient>,
    policy: Arc<ClinicalPolicy>,
}

impl RouterStage {
    pub fn new(model: Arc<dyn ModelClient>, policy: Arc<ClinicalPolicy>) -> Self {
        Self { model, policy }
    }
}

#[async_trait]
impl Task<ConversationState> for RouterStage {
    fn id(&self) -> &str {
        StageKey::Router.as_str()
    }

    async fn run(&self, state: ConversationState) -> Result<TaskResult<StateUpdate>> {
        let document_context = build_document_context(&state.documents_text);
        let (system_prompt, user_prompt) = prompts::router(&state.patient_info, &document_context);

        let raw = self
            .model
            .complete_json(&system_prompt, &user_prompt, CallOptions::json())
            .await;
        let route = decide_route(&raw, &state.patient_info, &document_context, &self.policy);

        info!(department = %route.department, confidence = ?route.confidence, "Route decided");

        let reply = format!(
            "分诊结果：{}。理由：{}。正在进入专科分析。",
            route.department,
            route.reason.trim_end_matches('。')
        );
        let update = StateUpdate {
            turn: Some(ConversationTurn::assistant(reply.clone())),
            route: Some(route),
            assistant_reply: Some(reply.clone()),
            next_action: Some(NextStep::Continue),
            ..Default::default()
        };

        Ok(TaskResult::new(
            update,
            Some(reply),
            NextAction::ContinueAndExecute,
        ))
    }
}

/// Normalize the router answer. The department is always one of the four labels.
pub fn decide_route(
    raw: &Map<String, Value>,
    patient: &PatientRecord,
    document_context: &str,
    policy: &ClinicalPolicy,
) -> RouteDecision {
    let label = safe_text(raw.get("department"));
    let mut reason = safe_text(raw.get("reason"));

    let department = match Department::from_label(&label) {
        Some(department) => department,
        None => {
            let department = policy.route(patient);
            warn!(
                model_department = %label,
                fallback = %department,
                "Router answer outside the department set, using keyword rules"
            );
            // the model's reason argued for a department we are not using
            reason = FALLBACK_REASON.to_string();
            department
        }
    };

    if reason.is_empty() {
        reason = DEFAULT_REASON.to_string();
    }
    if has_documents(document_context) {
        reason = append_marker(&reason);
    }

    RouteDecision {
        department,
        reason,
        key_evidence: to_str_list(raw.get("key_evidence"), MAX_EVIDENCE),
        confidence: clamp_confidence(raw.get("confidence")),
    }
}
