//! Coercing loosely typed model output into the shapes the conversation record needs.

use serde_json::{Map, Value};

use crate::models::{ConversationTurn, Role};

/// Text the stages see when no reference material was uploaded
pub const NO_DOCUMENTS: &str = "无上传参考材料";
pub const DOCUMENT_MARKER: &str = "（已参考上传材料）";
const DOCUMENT_MARKER_CORE: &str = "已参考上传材料";

pub const DOCUMENT_CONTEXT_BUDGET: usize = 3000;
pub const HISTORY_TURNS: usize = 20;
pub const DEFAULT_LIST_CAP: usize = 20;

/// Trimmed text of a scalar value; `null`, missing and blank values give `""`.
pub fn safe_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string().trim().to_string(),
    }
}

pub fn text_or(value: Option<&Value>, default: &str) -> String {
    let text = safe_text(value);
    if text.is_empty() {
        default.to_string()
    } else {
        text
    }
}

/// Ordered, deduplicated, non-blank strings of a JSON array, at most `max_items`.
/// Anything that is not an array gives an empty list.
pub fn to_str_list(value: Option<&Value>, max_items: usize) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    let mut result: Vec<String> = Vec::new();
    for item in items {
        let text = safe_text(Some(item));
        if !text.is_empty() && !result.contains(&text) {
            result.push(text);
        }
        if result.len() >= max_items {
            break;
        }
    }
    result
}

/// Booleans from JSON bools or the usual textual spellings
pub fn as_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => true,
            "false" | "0" | "no" | "n" => false,
            _ => default,
        },
        _ => default,
    }
}

/// A finite float from a number or numeric text
pub fn optional_float(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

pub fn clamp_confidence(value: Option<&Value>) -> Option<f64> {
    optional_float(value).map(|c| c.clamp(0.0, 1.0))
}

/// Age from a non-negative number or numeric text; anything else is ignored.
pub fn lenient_age(value: Option<&Value>) -> Option<u32> {
    let age = optional_float(value)?;
    (0.0..=f64::from(u32::MAX))
        .contains(&age)
        .then(|| age.trunc() as u32)
}

/// The object stored under `key`, if it is one
pub fn object_field<'a>(raw: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    raw.get(key).and_then(Value::as_object)
}

/// Append the document marker unless the text already carries it.
pub fn append_marker(text: &str) -> String {
    if text.contains(DOCUMENT_MARKER_CORE) {
        text.to_string()
    } else {
        format!("{text}{DOCUMENT_MARKER}")
    }
}

/// Push `line` unless it is already present.
pub fn push_unique(items: &mut Vec<String>, line: &str) {
    if !items.iter().any(|item| item == line) {
        items.push(line.to_string());
    }
}

/// Numbered `参考材料N:` blocks for the non-blank documents, cut to the character budget.
pub fn build_document_context(documents_text: &[String]) -> String {
    let blocks: Vec<String> = documents_text
        .iter()
        .map(|text| text.trim())
        .filter(|text| !text.is_empty())
        .enumerate()
        .map(|(idx, text)| format!("参考材料{}:\n{}", idx + 1, text))
        .collect();

    if blocks.is_empty() {
        return NO_DOCUMENTS.to_string();
    }

    blocks
        .join("\n\n")
        .chars()
        .take(DOCUMENT_CONTEXT_BUDGET)
        .collect()
}

pub fn has_documents(document_context: &str) -> bool {
    document_context != NO_DOCUMENTS
}

/// The last turns as `role: content` lines, with the current input appended unless it is
/// already the final user turn.
pub fn history_to_text(history: &[ConversationTurn], user_input: &str) -> String {
    let start = history.len().saturating_sub(HISTORY_TURNS);
    let recent = &history[start..];

    let mut lines: Vec<String> = recent
        .iter()
        .filter(|turn| !turn.content.trim().is_empty())
        .map(|turn| format!("{}: {}", role_name(turn.role), turn.content.trim()))
        .collect();

    let user_input = user_input.trim();
    let already_last = recent
        .last()
        .is_some_and(|turn| turn.role == Role::User && turn.content.trim() == user_input);
    if !user_input.is_empty() && !already_last {
        lines.push(format!("user: {user_input}"));
    }

    lines.join("\n").trim().to_string()
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

/// Flatten newlines and cut to `max_chars` characters, marking the cut with `...`
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    if flat.chars().count() <= max_chars {
        flat.to_string()
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn safe_text_trims_and_stringifies() {
        assert_eq!(safe_text(Some(&json!("  咳嗽 "))), "咳嗽");
        assert_eq!(safe_text(Some(&json!(32))), "32");
        assert_eq!(safe_text(Some(&Value::Null)), "");
        assert_eq!(safe_text(None), "");
        assert_eq!(text_or(Some(&json!("   ")), "默认"), "默认");
    }

    #[test]
    fn str_list_dedupes_and_caps() {
        let value = json!(["咳嗽", " 咳嗽 ", "", null, "发热", "咽痛"]);
        assert_eq!(to_str_list(Some(&value), 20), vec!["咳嗽", "发热", "咽痛"]);
        assert_eq!(to_str_list(Some(&value), 2), vec!["咳嗽", "发热"]);
        assert!(to_str_list(Some(&json!("咳嗽")), 20).is_empty());
    }

    #[test]
    fn loose_booleans() {
        assert!(as_bool(Some(&json!("Yes")), false));
        assert!(!as_bool(Some(&json!("0")), true));
        assert!(as_bool(Some(&json!("maybe")), true));
        assert!(!as_bool(Some(&json!(1)), false));
        assert!(as_bool(None, true));
    }

    #[test]
    fn confidence_is_clamped_or_absent() {
        assert_eq!(clamp_confidence(Some(&json!(1.7))), Some(1.0));
        assert_eq!(clamp_confidence(Some(&json!("-0.3"))), Some(0.0));
        assert_eq!(clamp_confidence(Some(&json!("0.85"))), Some(0.85));
        assert_eq!(clamp_confidence(Some(&json!("high"))), None);
        assert_eq!(clamp_confidence(Some(&json!("NaN"))), None);
        assert_eq!(clamp_confidence(None), None);
    }

    #[test]
    fn age_is_lenient() {
        assert_eq!(lenient_age(Some(&json!(32))), Some(32));
        assert_eq!(lenient_age(Some(&json!("45"))), Some(45));
        assert_eq!(lenient_age(Some(&json!("45.9"))), Some(45));
        assert_eq!(lenient_age(Some(&json!(-3))), None);
        assert_eq!(lenient_age(Some(&json!("三十岁"))), None);
    }

    #[test]
    fn marker_is_idempotent() {
        for text in ["依据主要症状进行分诊。", "", "已参考上传材料的说明"] {
            let once = append_marker(text);
            assert_eq!(append_marker(&once), once);
            assert_eq!(once.matches(DOCUMENT_MARKER_CORE).count(), 1);
        }
    }

    #[test]
    fn document_context_numbers_blocks_and_respects_budget() {
        assert_eq!(build_document_context(&[]), NO_DOCUMENTS);
        assert_eq!(build_document_context(&["  ".to_string()]), NO_DOCUMENTS);

        let context = build_document_context(&["血常规正常".to_string(), "胸片无异常".to_string()]);
        assert_eq!(context, "参考材料1:\n血常规正常\n\n参考材料2:\n胸片无异常");
        assert!(has_documents(&context));

        let long = "检".repeat(5000);
        let context = build_document_context(&[long]);
        assert_eq!(context.chars().count(), DOCUMENT_CONTEXT_BUDGET);
    }

    #[test]
    fn history_text_appends_input_once() {
        let history = vec![
            ConversationTurn::assistant("请补充持续时间"),
            ConversationTurn::user("三天"),
        ];
        assert_eq!(
            history_to_text(&history, "三天"),
            "assistant: 请补充持续时间\nuser: 三天"
        );
        assert_eq!(
            history_to_text(&history[..1], "三天"),
            "assistant: 请补充持续时间\nuser: 三天"
        );

        let long: Vec<ConversationTurn> = (0..30)
            .map(|i| ConversationTurn::user(format!("msg{i}")))
            .collect();
        let text = history_to_text(&long, "msg29");
        assert_eq!(text.lines().count(), HISTORY_TURNS);
        assert!(text.starts_with("user: msg10"));
    }

    #[test]
    fn preview_flattens_and_cuts() {
        assert_eq!(preview("第一行\n第二行", 80), "第一行 第二行");
        assert_eq!(preview(&"字".repeat(90), 80), format!("{}...", "字".repeat(80)));
    }
}
