//! Prompt text for the four stages. Every builder returns `(system_prompt, user_prompt)`.

use serde::Serialize;
use serde_json::json;

use crate::models::{
    Department, FinalSummary, PatientRecord, RouteDecision, SpecialistFinding,
};

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

pub fn intake(
    history_text: &str,
    existing_info: &PatientRecord,
    document_context: &str,
) -> (String, String) {
    let system_prompt = "你是“询问智能体（Intake Agent）”。\
        你的职责是采集和补全问诊信息，不做诊断、不做开药。\
        你必须只输出严格 JSON，不允许输出 JSON 之外的任何文字。"
        .to_string();

    let user_prompt = format!(
        r#"请根据“历史对话 + 既有病历 + 上传参考材料”抽取并更新 patient_info。
输出 JSON（严格按此结构）：
{{
  "patient_info": {{
    "age": null,
    "sex": null,
    "chief_complaint": "",
    "duration": "",
    "severity": "",
    "symptoms": [],
    "allergies": [],
    "chronic_diseases": [],
    "current_meds": [],
    "additional_notes": ""
  }},
  "is_complete": true,
  "missing_fields": [],
  "missing_questions": []
}}

规则：
1) 只做信息采集，不要给诊断结论，不要给药物建议。
2) is_complete=true 的条件：chief_complaint、duration、severity 三项都有明确内容。
3) missing_fields 只能从以下字段中选择：age, sex, chief_complaint, duration, severity, symptoms, allergies, chronic_diseases, current_meds。
4) missing_questions 必须是给患者看的中文完整问题，且尽量包含示例；禁止只输出英文键名（例如 severity）。
5) 若上传材料与用户最新描述冲突，以用户最新描述为准；可在 additional_notes 中记录冲突信息。
6) 信息不确定时不要猜测，保持为空。

existing_info = {existing}
history =
{history_text}
uploaded_reference = {reference}"#,
        existing = to_json(existing_info),
        reference = to_json(document_context),
    );

    (system_prompt, user_prompt)
}

pub fn router(patient_info: &PatientRecord, document_context: &str) -> (String, String) {
    let system_prompt = "你是“路由智能体（Router Agent）”。\
        你需要根据患者信息分诊到一个最合适的科室：呼吸科、心血管科、消化内科、全科。\
        你必须只输出严格 JSON。"
        .to_string();

    let user_prompt = format!(
        r#"请输出 JSON：
{{
  "department": "呼吸科|心血管科|消化内科|全科",
  "reason": "",
  "confidence": 0.0,
  "key_evidence": []
}}

分诊规则：
1) 咳嗽、咳痰、气短、喘息等呼吸道症状为主时，优先呼吸科。
2) 胸痛、心悸、心慌、血压异常等心血管症状为主时，优先心血管科。
3) 腹痛、腹泻、反酸、恶心、呕吐等消化症状为主时，优先消化内科。
4) 信息不足或症状交叉明显时，路由到全科。
5) 若上传材料与用户最新主诉冲突，以用户最新主诉为准。
6) reason 请用中文写清楚，便于患者理解。

patient_info = {patient}
uploaded_reference = {reference}"#,
        patient = to_json(patient_info),
        reference = to_json(document_context),
    );

    (system_prompt, user_prompt)
}

pub fn specialist(
    department: Department,
    patient_info: &PatientRecord,
    route: Option<&RouteDecision>,
    document_context: &str,
) -> (String, String) {
    let system_prompt = format!(
        "你是“{department}专科智能体（Specialist Agent）”。\
        请给出初步分析、可能方向、建议检查、可讨论的常见用药方向。\
        不要给出确定性诊断；不要给出药物剂量、频次、疗程。\
        你必须只输出严格 JSON。"
    );

    let user_prompt = format!(
        r#"请输出 JSON：
{{
  "preliminary_assessment": "",
  "possible_diagnoses": [],
  "recommended_checks": [],
  "medication_suggestions": [
    {{"name": "", "purpose": "", "otc": true}}
  ],
  "risk_alerts": []
}}

要求：
1) preliminary_assessment 用中文，面向患者可读。
2) possible_diagnoses 只写“可能方向”，不要写“已确诊”。
3) medication_suggestions 仅写“可与医生讨论的药物方向”，禁止剂量、频次、疗程。
4) risk_alerts 必须包含就医边界（何时应立即就医）。
5) 若上传材料与用户最新主诉冲突，以用户最新主诉为准。

patient_info = {patient}
route = {route}
uploaded_reference = {reference}"#,
        patient = to_json(patient_info),
        route = to_json(&route),
        reference = to_json(document_context),
    );

    (system_prompt, user_prompt)
}

pub fn summary(
    patient_info: &PatientRecord,
    route: Option<&RouteDecision>,
    specialist_result: Option<&SpecialistFinding>,
    document_context: &str,
) -> (String, String) {
    let system_prompt = "你是“开药诊断总结智能体（Summary Agent）”。\
        请将现有信息整合为患者可读总结，必须包含安全提醒和就医边界。\
        你必须只输出严格 JSON。"
        .to_string();

    let user_prompt = format!(
        r#"请输出 JSON：
{{
  "diagnosis_summary": "",
  "prescription_advice": [],
  "home_care": [],
  "follow_up": [],
  "emergency_signs": [],
  "disclaimer": ""
}}

要求：
1) diagnosis_summary 用中文简明描述“当前初步判断”。
2) prescription_advice 仅写“可与医生讨论”的建议，禁止出现具体处方剂量、频次、疗程。
3) home_care 写清楚可执行的居家护理建议。
4) follow_up 写明复诊时机（例如 2-3 天无缓解或加重时复诊）。
5) emergency_signs 写明立即就医信号（例如持续胸痛、呼吸困难、意识改变）。
6) disclaimer 必须明确：不能替代医生面诊与处方。
7) 若上传材料与用户最新主诉冲突，以用户最新主诉为准。

patient_info = {patient}
route = {route}
specialist_result = {specialist}
uploaded_reference = {reference}"#,
        patient = to_json(patient_info),
        route = to_json(&route),
        specialist = to_json(&specialist_result),
        reference = to_json(document_context),
    );

    (system_prompt, user_prompt)
}

/// Prompts for the streamed, patient-readable reply. The structured facts are already
/// settled; the model only turns them into prose.
pub fn summary_reply(
    patient_info: &PatientRecord,
    route: Option<&RouteDecision>,
    specialist_result: Option<&SpecialistFinding>,
    final_result: Option<&FinalSummary>,
    document_context: &str,
) -> (String, String) {
    let system_prompt = "你是医疗问诊总结助手。请基于结构化信息输出最终患者可读回复。\
        要求：中文、清晰、可执行；不要输出JSON；不要给药物剂量/频次/疗程。"
        .to_string();

    let payload = json!({
        "patient_info": patient_info,
        "route": route,
        "specialist_result": specialist_result,
        "final_result": final_result,
        "uploaded_reference": document_context,
    });

    let user_prompt = format!(
        "请按以下结构输出：\n\
        【初步判断】\n【可与医生讨论的用药方向】\n【居家护理】\n\
        【复诊建议】\n【立即就医信号】\n【免责声明】\n\n\
        如上传材料与用户最新主诉冲突，以用户最新主诉为准。\n\n\
        结构化输入：{payload}"
    );

    (system_prompt, user_prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::NO_DOCUMENTS;

    #[test]
    fn intake_prompt_embeds_history_and_record() {
        let record = PatientRecord {
            chief_complaint: "咳嗽".to_string(),
            ..Default::default()
        };
        let (system, user) = intake("user: 咳嗽三天", &record, NO_DOCUMENTS);

        assert!(system.contains("询问智能体"));
        assert!(user.contains("\"chief_complaint\":\"咳嗽\""));
        assert!(user.contains("history =\nuser: 咳嗽三天"));
        assert!(user.contains("uploaded_reference = \"无上传参考材料\""));
    }

    #[test]
    fn specialist_prompt_names_the_department() {
        let (system, user) = specialist(
            Department::Cardiology,
            &PatientRecord::default(),
            None,
            NO_DOCUMENTS,
        );
        assert!(system.starts_with("你是“心血管科专科智能体"));
        assert!(user.contains("route = null"));
    }

    #[test]
    fn reply_prompt_lists_the_six_sections() {
        let (system, user) = summary_reply(
            &PatientRecord::default(),
            None,
            None,
            Some(&FinalSummary::default()),
            NO_DOCUMENTS,
        );
        assert!(system.contains("不要输出JSON"));
        for header in [
            "【初步判断】",
            "【可与医生讨论的用药方向】",
            "【居家护理】",
            "【复诊建议】",
            "【立即就医信号】",
            "【免责声明】",
        ] {
            assert!(user.contains(header), "missing {header}");
        }
        assert!(user.contains("结构化输入：{"));
    }
}
