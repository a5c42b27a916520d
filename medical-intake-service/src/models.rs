use std::fmt;
use std::str::FromStr;

use graph_flow::{FlowState, GraphError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One message of the conversation. Turns are only ever appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Cumulative patient record, only updated by the intake stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientRecord {
    pub age: Option<u32>,
    pub sex: String,
    pub chief_complaint: String,
    pub duration: String,
    pub severity: String,
    pub symptoms: Vec<String>,
    pub allergies: Vec<String>,
    pub chronic_diseases: Vec<String>,
    pub current_meds: Vec<String>,
    pub additional_notes: String,
}

impl PatientRecord {
    pub fn has_value(&self, field: PatientField) -> bool {
        match field {
            PatientField::Age => self.age.is_some(),
            PatientField::Sex => !self.sex.trim().is_empty(),
            PatientField::ChiefComplaint => !self.chief_complaint.trim().is_empty(),
            PatientField::Duration => !self.duration.trim().is_empty(),
            PatientField::Severity => !self.severity.trim().is_empty(),
            PatientField::Symptoms => has_any(&self.symptoms),
            PatientField::Allergies => has_any(&self.allergies),
            PatientField::ChronicDiseases => has_any(&self.chronic_diseases),
            PatientField::CurrentMeds => has_any(&self.current_meds),
        }
    }

    /// Text the keyword rules look at: chief complaint, notes and symptoms
    pub fn keyword_text(&self) -> String {
        format!(
            "{} {} {}",
            self.chief_complaint.trim(),
            self.additional_notes.trim(),
            self.symptoms.join(" ")
        )
        .to_lowercase()
    }
}

fn has_any(items: &[String]) -> bool {
    items.iter().any(|item| !item.trim().is_empty())
}

/// The nine patient fields the intake stage may report as missing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientField {
    Age,
    Sex,
    ChiefComplaint,
    Duration,
    Severity,
    Symptoms,
    Allergies,
    ChronicDiseases,
    CurrentMeds,
}

impl PatientField {
    pub const ALL: [PatientField; 9] = [
        PatientField::Age,
        PatientField::Sex,
        PatientField::ChiefComplaint,
        PatientField::Duration,
        PatientField::Severity,
        PatientField::Symptoms,
        PatientField::Allergies,
        PatientField::ChronicDiseases,
        PatientField::CurrentMeds,
    ];

    pub const REQUIRED: [PatientField; 3] = [
        PatientField::ChiefComplaint,
        PatientField::Duration,
        PatientField::Severity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatientField::Age => "age",
            PatientField::Sex => "sex",
            PatientField::ChiefComplaint => "chief_complaint",
            PatientField::Duration => "duration",
            PatientField::Severity => "severity",
            PatientField::Symptoms => "symptoms",
            PatientField::Allergies => "allergies",
            PatientField::ChronicDiseases => "chronic_diseases",
            PatientField::CurrentMeds => "current_meds",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|field| field.as_str() == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntakeOutcome {
    pub is_complete: bool,
    pub missing_fields: Vec<PatientField>,
    pub missing_questions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Department {
    #[serde(rename = "呼吸科")]
    Respiratory,
    #[serde(rename = "心血管科")]
    Cardiology,
    #[serde(rename = "消化内科")]
    Gastroenterology,
    #[serde(rename = "全科")]
    General,
}

impl Department {
    pub const ALL: [Department; 4] = [
        Department::Respiratory,
        Department::Cardiology,
        Department::Gastroenterology,
        Department::General,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Department::Respiratory => "呼吸科",
            Department::Cardiology => "心血管科",
            Department::Gastroenterology => "消化内科",
            Department::General => "全科",
        }
    }

    /// Exact match on the canonical label; anything else is not a department
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL.into_iter().find(|dept| dept.label() == label)
    }
}

impl fmt::Display for Department {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub department: Department,
    pub reason: String,
    pub key_evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicationSuggestion {
    pub name: String,
    pub purpose: String,
    pub otc: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecialistFinding {
    pub preliminary_assessment: String,
    pub possible_diagnoses: Vec<String>,
    pub recommended_checks: Vec<String>,
    pub medication_suggestions: Vec<MedicationSuggestion>,
    pub risk_alerts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalSummary {
    pub diagnosis_summary: String,
    pub prescription_advice: Vec<String>,
    pub home_care: Vec<String>,
    pub follow_up: Vec<String>,
    pub emergency_signs: Vec<String>,
    pub disclaimer: String,
}

/// Where the conversation goes after a stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStep {
    AskUserMore,
    #[default]
    Continue,
    Done,
}

impl NextStep {
    pub fn case_status(&self) -> CaseStatus {
        match self {
            NextStep::AskUserMore => CaseStatus::Collecting,
            NextStep::Done => CaseStatus::Closed,
            NextStep::Continue => CaseStatus::InProgress,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Collecting,
    Closed,
    InProgress,
}

/// Pipeline stages, in the order the controller runs them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKey {
    Intake,
    Router,
    Specialist,
    SummaryStructured,
    SummaryReply,
}

impl StageKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKey::Intake => "intake",
            StageKey::Router => "router",
            StageKey::Specialist => "specialist",
            StageKey::SummaryStructured => "summary_structured",
            StageKey::SummaryReply => "summary_reply",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageKey::Intake => "询问智能体",
            StageKey::Router => "路由智能体",
            StageKey::Specialist => "专科智能体",
            StageKey::SummaryStructured => "总结智能体(结构化)",
            StageKey::SummaryReply => "总结智能体(流式回复)",
        }
    }
}

impl FromStr for StageKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intake" => Ok(StageKey::Intake),
            "router" => Ok(StageKey::Router),
            "specialist" => Ok(StageKey::Specialist),
            "summary_structured" => Ok(StageKey::SummaryStructured),
            "summary_reply" => Ok(StageKey::SummaryReply),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded reference document and its extracted text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub doc_id: String,
    pub filename: String,
    pub content_type: String,
    pub extracted_text: String,
}

/// Everything known about one conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationState {
    pub history: Vec<ConversationTurn>,
    /// The user utterance of the turn being processed
    pub user_input: String,
    pub patient_info: PatientRecord,
    pub intake: Option<IntakeOutcome>,
    pub route: Option<RouteDecision>,
    pub specialist_result: Option<SpecialistFinding>,
    pub final_result: Option<FinalSummary>,
    pub assistant_reply: String,
    pub next_action: NextStep,
    pub documents: Vec<DocumentRecord>,
    pub documents_text: Vec<String>,
}

impl ConversationState {
    /// Record a new user utterance and refresh the document texts for the turn.
    pub fn begin_turn(&mut self, user_input: &str) {
        let user_input = user_input.trim().to_string();
        self.history.push(ConversationTurn::user(user_input.clone()));
        self.user_input = user_input;
        self.documents_text = self
            .documents
            .iter()
            .map(|doc| doc.extracted_text.trim())
            .filter(|text| !text.is_empty())
            .map(str::to_string)
            .collect();
    }

    /// Store the streamed (or rendered) final reply of a completed turn.
    pub fn finish_reply(&mut self, reply: String) {
        self.history.push(ConversationTurn::assistant(reply.clone()));
        self.assistant_reply = reply;
        self.next_action = NextStep::Done;
    }

    pub fn user_turns(&self) -> usize {
        self.history
            .iter()
            .filter(|turn| turn.role == Role::User)
            .count()
    }

    pub fn department(&self) -> Department {
        self.route
            .as_ref()
            .map(|route| route.department)
            .unwrap_or(Department::General)
    }
}

/// Partial state produced by one stage; `None` leaves the field untouched
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    /// The assistant turn the stage appends to the history
    pub turn: Option<ConversationTurn>,
    pub patient_info: Option<PatientRecord>,
    pub intake: Option<IntakeOutcome>,
    pub route: Option<RouteDecision>,
    pub specialist_result: Option<SpecialistFinding>,
    pub final_result: Option<FinalSummary>,
    pub assistant_reply: Option<String>,
    pub next_action: Option<NextStep>,
}

impl StateUpdate {
    fn check(&self, stage: StageKey) -> Result<(), String> {
        if let Some(turn) = &self.turn {
            if turn.role != Role::Assistant {
                return Err("stages may only append assistant turns".to_string());
            }
        }
        if self.next_action.is_none() {
            return Err("update carries no next_action".to_string());
        }

        let (present, name, wants_turn) = match stage {
            StageKey::Intake => (
                self.patient_info.is_some() && self.intake.is_some(),
                "patient_info and intake",
                true,
            ),
            StageKey::Router => (self.route.is_some(), "route", true),
            StageKey::Specialist => (self.specialist_result.is_some(), "specialist_result", true),
            StageKey::SummaryStructured => (self.final_result.is_some(), "final_result", false),
            StageKey::SummaryReply => return Err("the reply phase is not a graph task".to_string()),
        };

        if !present {
            return Err(format!("missing {name}"));
        }
        if wants_turn != self.turn.is_some() {
            return Err(if wants_turn {
                "expected exactly one assistant turn".to_string()
            } else {
                "structured summary must not append a turn".to_string()
            });
        }
        Ok(())
    }
}

impl FlowState for ConversationState {
    type Update = StateUpdate;

    fn apply(&mut self, task_id: &str, update: StateUpdate) -> graph_flow::Result<()> {
        let violation = |reason: String| GraphError::ContractViolation {
            task_id: task_id.to_string(),
            reason,
        };

        let stage = task_id.parse::<StageKey>().map_err(violation)?;
        update.check(stage).map_err(violation)?;

        if let Some(turn) = update.turn {
            self.history.push(turn);
        }
        if let Some(patient_info) = update.patient_info {
            self.patient_info = patient_info;
        }
        if let Some(intake) = update.intake {
            self.intake = Some(intake);
        }
        if let Some(route) = update.route {
            self.route = Some(route);
        }
        if let Some(specialist_result) = update.specialist_result {
            self.specialist_result = Some(specialist_result);
        }
        if let Some(final_result) = update.final_result {
            self.final_result = Some(final_result);
        }
        if let Some(reply) = update.assistant_reply {
            self.assistant_reply = reply;
        }
        if let Some(next_action) = update.next_action {
            self.next_action = next_action;
        }
        Ok(())
    }
}
