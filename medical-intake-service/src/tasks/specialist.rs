use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{NextAction, Result, Task, TaskResult};
use serde_json::{Map, Value};
use tracing::info;

use super::prompts;
use crate::llm::{CallOptions, ModelClient};
use crate::models::{
    ConversationState, ConversationTurn, MedicationSuggestion, NextStep, PatientRecord,
    SpecialistFinding, StageKey, StateUpdate,
};
use crate::normalize::{
    DEFAULT_LIST_CAP, append_marker, as_bool, build_document_context, has_documents,
    push_unique, text_or, to_str_list,
};
use crate::policy::ClinicalPolicy;

const DEFAULT_ASSESSMENT: &str = "当前信息不足，建议线下面诊并完善检查。";
const DEFAULT_RISK_ALERT: &str = "若症状持续或加重，请及时线下就医。";
pub const URGENT_RISK_ALERT: &str = "若出现持续胸痛、呼吸困难或意识改变，请立即急诊就医。";

/// Department-specific preliminary assessment
pub struct SpecialistStage {
    model: Arc<dyn ModelClient>,
    policy: Arc<ClinicalPolicy>,
}

impl SpecialistStage {
    pub fn new(model: Arc<dyn ModelClient>, policy: Arc<ClinicalPolicy>) -> Self {
        Self { model, policy }
    }
}

#[async_trait]
impl Task<ConversationState> for SpecialistStage {
    fn id(&self) -> &str {
        StageKey::Specialist.as_str()
    }

    async fn run(&self, state: ConversationState) -> Result<TaskResult<StateUpdate>> {
        let department = state.department();
        let document_context = build_document_context(&state.documents_text);
        let (system_prompt, user_prompt) = prompts::specialist(
            department,
            &state.patient_info,
            state.route.as_ref(),
            &document_context,
        );

        let raw = self
            .model
            .complete_json(&system_prompt, &user_prompt, CallOptions::json())
            .await;
        let finding =
            normalize_finding(&raw, &state.patient_info, &document_context, &self.policy);

        info!(
            department = %department,
            diagnoses = finding.possible_diagnoses.len(),
            risk_alerts = finding.risk_alerts.len(),
            "Specialist assessment ready"
        );

        let reply = format!("{department}专科已完成初步评估，正在生成最终总结。");
        let update = StateUpdate {
            turn: Some(ConversationTurn::assistant(reply.clone())),
            specialist_result: Some(finding),
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

pub fn normalize_finding(
    raw: &Map<String, Value>,
    patient: &PatientRecord,
    document_context: &str,
    policy: &ClinicalPolicy,
) -> SpecialistFinding {
    let mut preliminary_assessment =
        text_or(raw.get("preliminary_assessment"), DEFAULT_ASSESSMENT);
    let recommended_checks =
        policy.apply_checks(to_str_list(raw.get("recommended_checks"), DEFAULT_LIST_CAP));

    let mut risk_alerts = to_str_list(raw.get("risk_alerts"), DEFAULT_LIST_CAP);
    if risk_alerts.is_empty() {
        risk_alerts.push(DEFAULT_RISK_ALERT.to_string());
    }
    if policy.has_red_flag(patient) {
        push_unique(&mut risk_alerts, URGENT_RISK_ALERT);
    }

    if has_documents(document_context) {
        preliminary_assessment = append_marker(&preliminary_assessment);
    }

    SpecialistFinding {
        preliminary_assessment,
        possible_diagnoses: to_str_list(raw.get("possible_diagnoses"), DEFAULT_LIST_CAP),
        recommended_checks,
        medication_suggestions: medication_suggestions(raw.get("medication_suggestions")),
        risk_alerts,
    }
}

/// Object entries only; missing parts get neutral defaults.
fn medication_suggestions(value: Option<&Value>) -> Vec<MedicationSuggestion> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(Value::as_object)
        .take(DEFAULT_LIST_CAP)
        .map(|item| MedicationSuggestion {
            name: text_or(item.get("name"), "未命名药物"),
            purpose: text_or(item.get("purpose"), "用于对症支持"),
            otc: as_bool(item.get("otc"), true),
        })
        .collect()
}
