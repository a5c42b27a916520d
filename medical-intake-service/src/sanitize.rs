//! Recovering a JSON object from free-form model output.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```(?:json)?\s*(.*?)```").expect("fence pattern compiles"));

/// Extract the JSON object embedded in `text`.
///
/// Tried in order: the whole (trimmed) text, the first fenced block (tagged `json` or untagged), then the
/// slice from the first `{` to the last `}`. Anything that does not parse to an object
/// yields an empty map.
pub fn sanitize_json(text: &str) -> Map<String, Value> {
    let text = text.trim();
    if text.is_empty() {
        return Map::new();
    }

    if let Some(object) = parse_object(text) {
        return object;
    }

    if let Some(object) = FENCED_JSON
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|block| parse_object(block.as_str().trim()))
    {
        return object;
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => {
            parse_object(&text[start..=end]).unwrap_or_default()
        }
        _ => Map::new(),
    }
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}
