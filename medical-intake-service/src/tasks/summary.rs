use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{NextAction, Result, Task, TaskResult};
use serde_json::{Map, Value};
use tracing::info;

use super::prompts;
use crate::llm::{CallOptions, FragmentStream, ModelClient};
use crate::models::{
    ConversationState, FinalSummary, NextStep, PatientRecord, StageKey, StateUpdate,
};
use crate::normalize::{
    DEFAULT_LIST_CAP, NO_DOCUMENTS, append_marker, build_document_context, has_documents,
    push_unique, text_or, to_str_list,
};
use crate::policy::ClinicalPolicy;

const DEFAULT_DIAGNOSIS: &str = "当前结果为初步健康评估，建议结合线下面诊进一步明确。";
const DEFAULT_PRESCRIPTION: &str = "可与医生讨论是否需要对症药物。";
const DEFAULT_HOME_CARE: [&str; 4] = ["规律休息", "补充水分", "清淡饮食", "观察症状变化"];
const DEFAULT_FOLLOW_UP: &str = "若 2-3 天无缓解或症状加重，请及时复诊。";
const DEFAULT_EMERGENCY_SIGNS: [&str; 4] = ["持续胸痛", "呼吸困难", "意识改变", "高热不退"];
const DEFAULT_DISCLAIMER: &str = "本结果仅作健康参考，不替代医生面诊与处方。";
pub const URGENT_EMERGENCY_SIGN: &str = "若出现持续胸痛或呼吸困难加重，请立即急诊就医。";

/// Final summary, in two phases.
///
/// As a graph task it produces the structured [`FinalSummary`] and ends the graph run.
/// The patient-facing reply is produced afterwards by [`SummaryStage::stream_reply`],
/// with [`SummaryStage::fallback_reply`] as the deterministic rendering when the stream
/// fails or stays empty.
pub struct SummaryStage {
    model: Arc<dyn ModelClient>,
    policy: Arc<ClinicalPolicy>,
}

impl SummaryStage {
    pub fn new(model: Arc<dyn ModelClient>, policy: Arc<ClinicalPolicy>) -> Self {
        Self { model, policy }
    }

    pub async fn stream_reply(&self, state: &ConversationState) -> anyhow::Result<FragmentStream> {
        let document_context = build_document_context(&state.documents_text);
        let (system_prompt, user_prompt) = prompts::summary_reply(
            &state.patient_info,
            state.route.as_ref(),
            state.specialist_result.as_ref(),
            state.final_result.as_ref(),
            &document_context,
        );

        self.model
            .stream(&system_prompt, &user_prompt, CallOptions::reply_stream())
            .await
    }

    pub fn fallback_reply(&self, state: &ConversationState) -> String {
        let summary = match &state.final_result {
            Some(summary) => summary.clone(),
            None => normalize_final_summary(
                &Map::new(),
                &PatientRecord::default(),
                NO_DOCUMENTS,
                &self.policy,
            ),
        };
        render_final_reply(&state.department().to_string(), &summary)
    }
}

#[async_trait]
impl Task<ConversationState> for SummaryStage {
    fn id(&self) -> &str {
        StageKey::SummaryStructured.as_str()
    }

    async fn run(&self, state: ConversationState) -> Result<TaskResult<StateUpdate>> {
        let document_context = build_document_context(&state.documents_text);
        let (system_prompt, user_prompt) = prompts::summary(
            &state.patient_info,
            state.route.as_ref(),
            state.specialist_result.as_ref(),
            &document_context,
        );

        let raw = self
            .model
            .complete_json(&system_prompt, &user_prompt, CallOptions::json())
            .await;
        let summary =
            normalize_final_summary(&raw, &state.patient_info, &document_context, &self.policy);

        info!(
            emergency_signs = summary.emergency_signs.len(),
            "Structured summary ready"
        );

        // no history turn here; the reply phase appends it
        let update = StateUpdate {
            final_result: Some(summary),
            next_action: Some(NextStep::Done),
            ..Default::default()
        };

        Ok(TaskResult::new(update, None, NextAction::End))
    }
}

pub fn normalize_final_summary(
    raw: &Map<String, Value>,
    patient: &PatientRecord,
    document_context: &str,
    policy: &ClinicalPolicy,
) -> FinalSummary {
    let mut diagnosis_summary = text_or(raw.get("diagnosis_summary"), DEFAULT_DIAGNOSIS);
    let mut emergency_signs = list_or(raw, "emergency_signs", &DEFAULT_EMERGENCY_SIGNS);

    if policy.has_red_flag(patient) {
        push_unique(&mut emergency_signs, URGENT_EMERGENCY_SIGN);
    }
    if has_documents(document_context) {
        diagnosis_summary = append_marker(&diagnosis_summary);
    }

    FinalSummary {
        diagnosis_summary,
        prescription_advice: list_or(raw, "prescription_advice", &[DEFAULT_PRESCRIPTION]),
        home_care: list_or(raw, "home_care", &DEFAULT_HOME_CARE),
        follow_up: list_or(raw, "follow_up", &[DEFAULT_FOLLOW_UP]),
        emergency_signs,
        disclaimer: text_or(raw.get("disclaimer"), DEFAULT_DISCLAIMER),
    }
}

fn list_or(raw: &Map<String, Value>, key: &str, defaults: &[&str]) -> Vec<String> {
    let items = to_str_list(raw.get(key), DEFAULT_LIST_CAP);
    if items.is_empty() {
        defaults.iter().map(|item| item.to_string()).collect()
    } else {
        items
    }
}

fn bullets(items: &[String]) -> String {
    if items.is_empty() {
        return "- 暂无".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deterministic patient-readable rendering of a structured summary.
pub fn render_final_reply(department: &str, summary: &FinalSummary) -> String {
    format!(
        "【问诊总结】\n\
         分诊科室：{department}\n\
         初步判断：{diagnosis}\n\n\
         【建议用药（仅供与医生讨论）】\n{prescription}\n\n\
         【居家护理】\n{home_care}\n\n\
         【复诊建议】\n{follow_up}\n\n\
         【立即就医信号】\n{emergency}\n\n\
         【声明】{disclaimer}",
        diagnosis = summary.diagnosis_summary,
        prescription = bullets(&summary.prescription_advice),
        home_care = bullets(&summary.home_care),
        follow_up = bullets(&summary.follow_up),
        emergency = bullets(&summary.emergency_signs),
        disclaimer = summary.disclaimer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Department, RouteDecision};
    use crate::test_support::{ScriptedModel, StreamScript};
    use futures::StreamExt;
    use serde_json::json;

    fn raw(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn every_list_is_filled_for_an_empty_answer() {
        let summary = normalize_final_summary(
            &Map::new(),
            &PatientRecord::default(),
            NO_DOCUMENTS,
            &ClinicalPolicy::default(),
        );

        assert_eq!(summary.diagnosis_summary, DEFAULT_DIAGNOSIS);
        assert_eq!(summary.prescription_advice, vec![DEFAULT_PRESCRIPTION]);
        assert_eq!(summary.home_care, DEFAULT_HOME_CARE);
        assert_eq!(summary.follow_up, vec![DEFAULT_FOLLOW_UP]);
        assert_eq!(summary.emergency_signs, DEFAULT_EMERGENCY_SIGNS);
        assert_eq!(summary.disclaimer, DEFAULT_DISCLAIMER);
    }

    #[test]
    fn non_list_values_count_as_empty() {
        let answer = raw(json!({
            "home_care": "多喝水",
            "follow_up": [],
            "emergency_signs": [null, "", 3],
        }));
        let summary = normalize_final_summary(
            &answer,
            &PatientRecord::default(),
            NO_DOCUMENTS,
            &ClinicalPolicy::default(),
        );

        assert_eq!(summary.home_care, DEFAULT_HOME_CARE);
        assert_eq!(summary.follow_up, vec![DEFAULT_FOLLOW_UP]);
        assert!(!summary.emergency_signs.is_empty());
    }

    #[test]
    fn red_flag_line_is_added_once() {
        let patient = PatientRecord {
            chief_complaint: "持续胸痛两小时".to_string(),
            ..Default::default()
        };
        let policy = ClinicalPolicy::default();

        let first = normalize_final_summary(&Map::new(), &patient, NO_DOCUMENTS, &policy);
        let answer = raw(json!({"emergency_signs": first.emergency_signs.clone()}));
        let second = normalize_final_summary(&answer, &patient, NO_DOCUMENTS, &policy);

        for summary in [first, second] {
            assert_eq!(
                summary
                    .emergency_signs
                    .iter()
                    .filter(|line| *line == URGENT_EMERGENCY_SIGN)
                    .count(),
                1
            );
        }
    }

    #[test]
    fn documents_mark_the_diagnosis() {
        let summary = normalize_final_summary(
            &raw(json!({"diagnosis_summary": "考虑急性支气管炎（已参考上传材料）"})),
            &PatientRecord::default(),
            "参考材料1:\n胸片",
            &ClinicalPolicy::default(),
        );
        assert_eq!(summary.diagnosis_summary.matches("已参考上传材料").count(), 1);
    }

    #[test]
    fn rendering_lists_bullets_and_placeholders() {
        let summary = FinalSummary {
            diagnosis_summary: "上呼吸道感染可能".to_string(),
            prescription_advice: vec![],
            home_care: vec!["多饮水".to_string(), "休息".to_string()],
            follow_up: vec!["三天后复诊".to_string()],
            emergency_signs: vec!["呼吸困难".to_string()],
            disclaimer: "仅供参考".to_string(),
        };
        let text = render_final_reply("呼吸科", &summary);

        assert!(text.starts_with("【问诊总结】\n分诊科室：呼吸科\n初步判断：上呼吸道感染可能"));
        assert!(text.contains("【建议用药（仅供与医生讨论）】\n- 暂无\n\n"));
        assert!(text.contains("【居家护理】\n- 多饮水\n- 休息\n\n"));
        assert!(text.ends_with("【声明】仅供参考"));
    }

    #[test]
    fn fallback_works_without_a_structured_summary() {
        let stage = SummaryStage::new(
            Arc::new(ScriptedModel::new()),
            Arc::new(ClinicalPolicy::default()),
        );
        let text = stage.fallback_reply(&ConversationState::default());

        assert!(text.contains("分诊科室：全科"));
        assert!(text.contains(DEFAULT_DISCLAIMER));
    }

    #[tokio::test]
    async fn structured_phase_ends_without_a_turn() {
        let model = Arc::new(ScriptedModel::new().with_json(
            StageKey::SummaryStructured,
            json!({"diagnosis_summary": "胃食管反流可能"}),
        ));
        let stage = SummaryStage::new(model, Arc::new(ClinicalPolicy::default()));

        let result = stage.run(ConversationState::default()).await.unwrap();

        assert_eq!(result.next_action, NextAction::End);
        assert!(result.response.is_none());
        assert!(result.update.turn.is_none());
        assert_eq!(result.update.next_action, Some(NextStep::Done));
        assert_eq!(
            result.update.final_result.unwrap().diagnosis_summary,
            "胃食管反流可能"
        );
    }

    #[tokio::test]
    async fn reply_stream_yields_model_fragments() {
        let model = Arc::new(ScriptedModel::new().with_stream(StreamScript::Fragments(vec![
            "【初步判断】".to_string(),
            "考虑感冒".to_string(),
        ])));
        let stage = SummaryStage::new(model.clone(), Arc::new(ClinicalPolicy::default()));
        let state = ConversationState {
            route: Some(RouteDecision {
                department: Department::Respiratory,
                reason: "咳嗽".to_string(),
                key_evidence: vec![],
                confidence: None,
            }),
            ..Default::default()
        };

        let fragments: Vec<String> = stage
            .stream_reply(&state)
            .await
            .unwrap()
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(fragments.concat(), "【初步判断】考虑感冒");
        assert_eq!(model.calls(StageKey::SummaryReply), 1);
    }
}
