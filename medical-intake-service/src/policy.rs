//! Clinical keyword data used by the routing fallback and the red-flag safety net.
//!
//! The defaults carry the Chinese keyword sets; a YAML file can replace any part of it.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Department, PatientRecord};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read clinical policy {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid clinical policy: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// One keyword rule of the routing fallback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub department: Department,
    pub keywords: Vec<String>,
}

/// What happens to the checks the specialist model recommends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ChecksPolicy {
    /// A non-empty model list is replaced by `checks`
    ReplaceWithStandard { checks: Vec<String> },
    KeepModelOutput,
}

impl Default for ChecksPolicy {
    fn default() -> Self {
        ChecksPolicy::ReplaceWithStandard {
            checks: strings(&["血常规", "必要时影像学检查"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinicalPolicy {
    /// Evaluated in order; the first rule with a matching keyword wins
    pub routing_rules: Vec<RoutingRule>,
    pub fallback_department: Department,
    pub red_flags: Vec<String>,
    pub recommended_checks: ChecksPolicy,
}

impl Default for ClinicalPolicy {
    fn default() -> Self {
        Self {
            routing_rules: vec![
                RoutingRule {
                    department: Department::Respiratory,
                    keywords: strings(&["咳", "喘", "呼吸", "痰", "气短", "胸闷"]),
                },
                RoutingRule {
                    department: Department::Cardiology,
                    keywords: strings(&["胸痛", "心悸", "心慌", "心率", "血压", "心口"]),
                },
                RoutingRule {
                    department: Department::Gastroenterology,
                    keywords: strings(&["腹痛", "腹泻", "反酸", "胃痛", "恶心", "呕吐"]),
                },
            ],
            fallback_department: Department::General,
            red_flags: strings(&[
                "胸痛",
                "呼吸困难",
                "意识不清",
                "昏迷",
                "抽搐",
                "咯血",
                "高热不退",
            ]),
            recommended_checks: ChecksPolicy::default(),
        }
    }
}

impl ClinicalPolicy {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PolicyError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Keyword routing over chief complaint, notes and symptoms.
    pub fn route(&self, patient: &PatientRecord) -> Department {
        let text = patient.keyword_text();
        self.routing_rules
            .iter()
            .find(|rule| contains_any(&text, &rule.keywords))
            .map(|rule| rule.department)
            .unwrap_or(self.fallback_department)
    }

    pub fn has_red_flag(&self, patient: &PatientRecord) -> bool {
        contains_any(&patient.keyword_text(), &self.red_flags)
    }

    pub fn apply_checks(&self, model_checks: Vec<String>) -> Vec<String> {
        match &self.recommended_checks {
            ChecksPolicy::ReplaceWithStandard { checks } if !model_checks.is_empty() => {
                checks.clone()
            }
            _ => model_checks,
        }
    }
}

fn contains_any(text: &str, keywords: &[String]) -> bool {
    keywords
        .iter()
        .map(|keyword| keyword.trim().to_lowercase())
        .any(|keyword| !keyword.is_empty() && text.contains(&keyword))
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient(chief_complaint: &str, symptoms: &[&str]) -> PatientRecord {
        PatientRecord {
            chief_complaint: chief_complaint.to_string(),
            symptoms: strings(symptoms),
            ..Default::default()
        }
    }

    #[test]
    fn routing_follows_rule_priority() {
        let policy = ClinicalPolicy::default();
        assert_eq!(policy.route(&patient("咳嗽伴胸痛", &[])), Department::Respiratory);
        assert_eq!(policy.route(&patient("胸痛两天", &["心慌"])), Department::Cardiology);
        assert_eq!(policy.route(&patient("", &["反酸"])), Department::Gastroenterology);
        assert_eq!(policy.route(&patient("头晕", &[])), Department::General);
    }

    #[test]
    fn matching_ignores_case() {
        let policy = ClinicalPolicy::from_yaml_str(
            r#"
routing_rules:
  - department: 心血管科
    keywords: ["ECG"]
"#,
        )
        .unwrap();
        assert_eq!(policy.route(&patient("ecg abnormal", &[])), Department::Cardiology);
        // fields left out of the file keep their defaults
        assert!(policy.has_red_flag(&patient("持续胸痛", &[])));
    }

    #[test]
    fn red_flags_scan_notes_and_symptoms() {
        let policy = ClinicalPolicy::default();
        let mut record = patient("发热", &["咯血"]);
        assert!(policy.has_red_flag(&record));

        record.symptoms.clear();
        assert!(!policy.has_red_flag(&record));
        record.additional_notes = "夜间呼吸困难".to_string();
        assert!(policy.has_red_flag(&record));
    }

    #[test]
    fn checks_policy_modes() {
        let policy = ClinicalPolicy::default();
        assert_eq!(
            policy.apply_checks(strings(&["胸部CT", "心电图", "肺功能"])),
            strings(&["血常规", "必要时影像学检查"])
        );
        assert!(policy.apply_checks(Vec::new()).is_empty());

        let keep = ClinicalPolicy::from_yaml_str("recommended_checks:\n  mode: keep_model_output\n")
            .unwrap();
        assert_eq!(keep.apply_checks(strings(&["心电图"])), strings(&["心电图"]));
    }

    #[test]
    fn invalid_yaml_is_reported() {
        let err = ClinicalPolicy::from_yaml_str("routing_rules:\n  - department: 骨科\n    keywords: []\n")
            .unwrap_err();
        assert!(matches!(err, PolicyError::Parse(_)));
        assert!(matches!(
            ClinicalPolicy::load("/nonexistent/policy.yaml"),
            Err(PolicyError::Io { .. })
        ));
    }
}
