use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{NextAction, Result, Task, TaskResult};
use serde_json::{Map, Value};
use tracing::info;

use super::prompts;
use crate::llm::{CallOptions, ModelClient};
use crate::models::{
    ConversationState, ConversationTurn, IntakeOutcome, NextStep, PatientField, PatientRecord,
    StageKey, StateUpdate,
};
use crate::normalize::{
    DEFAULT_LIST_CAP, as_bool, build_document_context, history_to_text, lenient_age,
    object_field, push_unique, safe_text, to_str_list,
};

pub const INTAKE_COMPLETE_REPLY: &str = "收到，信息已基本完整，正在进入分诊与专科分析。";
const GENERIC_QUESTION: &str = "请补充主要不适、持续时间和严重程度。";
const MAX_QUESTIONS: usize = 8;

/// Patient-facing question for a missing field
pub fn field_question(field: PatientField) -> &'static str {
    match field {
        PatientField::ChiefComplaint => "你现在最不舒服的主要症状是什么？例如：咳嗽、胸闷、发热。",
        PatientField::Duration => "这些症状持续多久了？例如：3天、1周、1个月。",
        PatientField::Severity => {
            "症状严重程度如何？可用“轻/中/重”或“0-10分”（0=无症状，10=最严重）。例如：6分，夜里咳嗽会醒。"
        }
        PatientField::Age => "你的年龄是多少？例如：32岁。",
        PatientField::Sex => "你的生理性别是？例如：男/女。",
        PatientField::Symptoms => "还有哪些伴随症状？例如：流涕、咽痛、气短。",
        PatientField::Allergies => "有药物或食物过敏吗？没有可写“无”。",
        PatientField::ChronicDiseases => "有慢性病吗？例如：高血压、糖尿病；没有可写“无”。",
        PatientField::CurrentMeds => "目前正在使用哪些药物？没有可写“无”。",
    }
}

/// What one intake pass concluded
#[derive(Debug, Clone, PartialEq)]
pub struct IntakeAssessment {
    pub patient_info: PatientRecord,
    pub outcome: IntakeOutcome,
    pub reply: String,
    pub next_action: NextStep,
}

/// Collects patient information and decides whether the pipeline may go on
pub struct IntakeStage {
    model: Arc<dyn ModelClient>,
}

impl IntakeStage {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Task<ConversationState> for IntakeStage {
    fn id(&self) -> &str {
        StageKey::Intake.as_str()
    }

    async fn run(&self, state: ConversationState) -> Result<TaskResult<StateUpdate>> {
        let document_context = build_document_context(&state.documents_text);
        let history_text = history_to_text(&state.history, &state.user_input);
        let (system_prompt, user_prompt) =
            prompts::intake(&history_text, &state.patient_info, &document_context);

        let raw = self
            .model
            .complete_json(&system_prompt, &user_prompt, CallOptions::json())
            .await;
        let assessment = assess_intake(&state.patient_info, &raw);

        info!(
            is_complete = assessment.outcome.is_complete,
            missing = assessment.outcome.missing_fields.len(),
            "Intake assessed"
        );

        let next_action = match assessment.next_action {
            NextStep::AskUserMore => NextAction::WaitForInput,
            _ => NextAction::ContinueAndExecute,
        };
        let reply = assessment.reply.clone();
        let update = StateUpdate {
            turn: Some(ConversationTurn::assistant(assessment.reply.clone())),
            patient_info: Some(assessment.patient_info),
            intake: Some(assessment.outcome),
            assistant_reply: Some(assessment.reply),
            next_action: Some(assessment.next_action),
            ..Default::default()
        };

        Ok(TaskResult::new(update, Some(reply), next_action))
    }
}

/// Merge the model's findings into the record and decide completeness.
pub fn assess_intake(existing: &PatientRecord, raw: &Map<String, Value>) -> IntakeAssessment {
    let patient_info = merge_patient_record(existing, object_field(raw, "patient_info"));
    let mut missing_fields = normalize_missing_fields(raw.get("missing_fields"), &patient_info);

    let required_complete = PatientField::REQUIRED
        .iter()
        .all(|field| patient_info.has_value(*field));
    let model_complete = as_bool(raw.get("is_complete"), false);
    let is_complete = required_complete && (model_complete || missing_fields.is_empty());

    if is_complete {
        return IntakeAssessment {
            patient_info,
            outcome: IntakeOutcome {
                is_complete: true,
                missing_fields: Vec::new(),
                missing_questions: Vec::new(),
            },
            reply: INTAKE_COMPLETE_REPLY.to_string(),
            next_action: NextStep::Continue,
        };
    }

    if missing_fields.is_empty() {
        missing_fields = normalize_missing_fields(None, &patient_info);
    }
    let missing_questions = normalize_questions(raw.get("missing_questions"), &missing_fields);

    let numbered: Vec<String> = missing_questions
        .iter()
        .enumerate()
        .map(|(idx, question)| format!("{}. {}", idx + 1, question))
        .collect();
    let reply = format!("为了更准确地判断，请补充以下信息：\n{}", numbered.join("\n"));

    IntakeAssessment {
        patient_info,
        outcome: IntakeOutcome {
            is_complete: false,
            missing_fields,
            missing_questions,
        },
        reply,
        next_action: NextStep::AskUserMore,
    }
}

/// Field-by-field merge. Scalars change only on a non-empty value, lists are replaced
/// when the model sent a list.
fn merge_patient_record(
    existing: &PatientRecord,
    source: Option<&Map<String, Value>>,
) -> PatientRecord {
    let mut merged = existing.clone();
    let Some(source) = source else {
        return merged;
    };

    if let Some(age) = lenient_age(source.get("age")) {
        merged.age = Some(age);
    }

    let scalars: [(&str, &mut String); 5] = [
        ("sex", &mut merged.sex),
        ("chief_complaint", &mut merged.chief_complaint),
        ("duration", &mut merged.duration),
        ("severity", &mut merged.severity),
        ("additional_notes", &mut merged.additional_notes),
    ];
    for (key, slot) in scalars {
        let text = safe_text(source.get(key));
        if !text.is_empty() {
            *slot = text;
        }
    }

    let lists: [(&str, &mut Vec<String>); 4] = [
        ("symptoms", &mut merged.symptoms),
        ("allergies", &mut merged.allergies),
        ("chronic_diseases", &mut merged.chronic_diseases),
        ("current_meds", &mut merged.current_meds),
    ];
    for (key, slot) in lists {
        if let Some(value @ Value::Array(_)) = source.get(key) {
            *slot = to_str_list(Some(value), DEFAULT_LIST_CAP);
        }
    }

    merged
}

fn normalize_missing_fields(value: Option<&Value>, patient: &PatientRecord) -> Vec<PatientField> {
    let mut fields: Vec<PatientField> = Vec::new();
    for name in to_str_list(value, DEFAULT_LIST_CAP) {
        if let Some(field) = PatientField::parse(&name) {
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
    }
    for required in PatientField::REQUIRED {
        if !patient.has_value(required) && !fields.contains(&required) {
            fields.push(required);
        }
    }
    fields
}

/// Model questions with bare field names translated; derived from the missing fields
/// when the model asked nothing usable.
fn normalize_questions(value: Option<&Value>, missing_fields: &[PatientField]) -> Vec<String> {
    let mut questions: Vec<String> = Vec::new();

    for text in to_str_list(value, DEFAULT_LIST_CAP) {
        match PatientField::parse(&text) {
            Some(field) => push_unique(&mut questions, field_question(field)),
            None => push_unique(&mut questions, &text),
        }
    }
    if questions.is_empty() {
        for field in missing_fields {
            push_unique(&mut questions, field_question(*field));
        }
    }
    if questions.is_empty() {
        questions.push(GENERIC_QUESTION.to_string());
    }

    questions.truncate(MAX_QUESTIONS);
    questions
}
