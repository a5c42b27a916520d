//! Model-call transport used by the stages and the document extractor.

use std::collections::VecDeque;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openrouter;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::sanitize::sanitize_json;

const CHAT_COMPLETIONS_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Lazy sequence of non-empty reply fragments. An `Err` item ends the sequence early.
pub type FragmentStream = BoxStream<'static, anyhow::Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallOptions {
    /// `None` uses the client's configured temperature
    pub temperature: Option<f32>,
    pub max_tokens: u32,
}

impl CallOptions {
    pub fn json() -> Self {
        Self {
            temperature: None,
            max_tokens: 1600,
        }
    }

    pub fn reply_stream() -> Self {
        Self {
            temperature: Some(0.2),
            max_tokens: 1200,
        }
    }

    pub fn ocr() -> Self {
        Self {
            temperature: Some(0.0),
            max_tokens: 3000,
        }
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: CallOptions,
    ) -> anyhow::Result<String>;

    async fn stream(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: CallOptions,
    ) -> anyhow::Result<FragmentStream>;

    /// Complete and recover a JSON object from the answer. Transport failures and
    /// unparseable output both give an empty map.
    async fn complete_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: CallOptions,
    ) -> Map<String, Value> {
        match self.complete(system_prompt, user_prompt, options).await {
            Ok(text) => {
                let parsed = sanitize_json(&text);
                if parsed.is_empty() {
                    warn!(
                        response_chars = text.chars().count(),
                        "Model answer held no JSON object"
                    );
                }
                parsed
            }
            Err(e) => {
                warn!(error = %e, "Model call failed, continuing with an empty result");
                Map::new()
            }
        }
    }
}

/// An inline image for a vision call
#[derive(Debug, Clone)]
pub struct InlineImage {
    pub mime: String,
    pub base64: String,
}

impl InlineImage {
    fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.base64)
    }
}

#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn read_image(
        &self,
        system_prompt: &str,
        instruction: &str,
        image: &InlineImage,
        options: CallOptions,
    ) -> anyhow::Result<String>;
}

/// OpenRouter-backed transport
#[derive(Clone)]
pub struct OpenRouterClient {
    api_key: String,
    model: String,
    ocr_model: String,
    temperature: f32,
    http: Client,
}

impl OpenRouterClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            api_key: config.openrouter_api_key.clone(),
            model: config.model.clone(),
            ocr_model: config.ocr_model.clone(),
            temperature: config.temperature,
            http: Client::new(),
        }
    }

    async fn post_chat(&self, payload: &Value) -> anyhow::Result<reqwest::Response> {
        let response = self
            .http
            .post(CHAT_COMPLETIONS_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("LLM API request failed: {}", response.status()));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: CallOptions,
    ) -> anyhow::Result<String> {
        let client = openrouter::Client::new(&self.api_key);
        let agent = client
            .agent(&self.model)
            .preamble(system_prompt)
            .temperature(f64::from(options.temperature.unwrap_or(self.temperature)))
            .max_tokens(u64::from(options.max_tokens))
            .build();

        let answer = agent.prompt(user_prompt).await?;
        debug!(model = %self.model, answer_chars = answer.chars().count(), "Model call completed");
        Ok(answer.trim().to_string())
    }

    async fn stream(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: CallOptions,
    ) -> anyhow::Result<FragmentStream> {
        let payload = json!({
            "model": self.model,
            "stream": true,
            "temperature": options.temperature.unwrap_or(self.temperature),
            "max_tokens": options.max_tokens,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt}
            ]
        });

        let response = self.post_chat(&payload).await?;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();

        Ok(sse_fragments(body))
    }
}

#[async_trait]
impl VisionModel for OpenRouterClient {
    async fn read_image(
        &self,
        system_prompt: &str,
        instruction: &str,
        image: &InlineImage,
        options: CallOptions,
    ) -> anyhow::Result<String> {
        let payload = json!({
            "model": self.ocr_model,
            "temperature": options.temperature.unwrap_or(0.0),
            "max_tokens": options.max_tokens,
            "messages": [
                {"role": "system", "content": system_prompt},
                {
                    "role": "user",
                    "content": [
                        {"type": "text", "text": instruction},
                        {"type": "image_url", "image_url": {"url": image.data_url()}}
                    ]
                }
            ]
        });

        let response_json: Value = self.post_chat(&payload).await?.json().await?;
        message_text(&response_json["choices"][0]["message"]["content"])
            .ok_or_else(|| anyhow!("Invalid response format from LLM"))
    }
}

/// Message content is either a string or a list of `{type, text}` parts.
fn message_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string(),
        ),
        _ => None,
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Fragment(String),
    /// The provider reported an error inside the stream
    Failed(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    let Ok(chunk) = serde_json::from_str::<Value>(data) else {
        return SseLine::Skip;
    };
    if let Some(error) = chunk.get("error").filter(|error| !error.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return SseLine::Failed(message);
    }
    // fragments keep their whitespace, it is part of the reply text
    let content = &chunk["choices"][0]["delta"]["content"];
    let text = match content {
        Value::String(text) => text.clone(),
        Value::Array(_) => message_text(content).unwrap_or_default(),
        _ => String::new(),
    };
    if text.is_empty() {
        SseLine::Skip
    } else {
        SseLine::Fragment(text)
    }
}

struct SseReader {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    /// Reported once the pending fragments are drained
    failure: Option<anyhow::Error>,
    saw_done: bool,
    finished: bool,
}

impl SseReader {
    fn accept(&mut self, line: &str) {
        match parse_sse_line(line) {
            SseLine::Fragment(text) => self.pending.push_back(text),
            SseLine::Failed(message) => {
                warn!(error = %message, "Model stream reported an error");
                self.failure = Some(anyhow!("model stream error: {message}"));
                self.finished = true;
            }
            SseLine::Done => {
                self.saw_done = true;
                self.finished = true;
            }
            SseLine::Skip => {}
        }
    }
}

/// Turn an OpenAI-style SSE body into reply fragments, stopping at `[DONE]`.
///
/// A body that ends without `[DONE]`, or an error payload from the provider, yields a
/// trailing `Err` after the fragments received so far.
fn sse_fragments(body: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> FragmentStream {
    let reader = SseReader {
        body,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        failure: None,
        saw_done: false,
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(fragment) = reader.pending.pop_front() {
                return Some((Ok(fragment), reader));
            }
            if let Some(failure) = reader.failure.take() {
                return Some((Err(failure), reader));
            }
            if reader.finished {
                return None;
            }

            match reader.body.next().await {
                Some(Ok(bytes)) => {
                    reader.buffer.extend_from_slice(&bytes);
                    while !reader.finished {
                        let Some(pos) = reader.buffer.iter().position(|b| *b == b'\n') else {
                            break;
                        };
                        let line: Vec<u8> = reader.buffer.drain(..=pos).collect();
                        reader.accept(&String::from_utf8_lossy(&line));
                    }
                }
                Some(Err(e)) => {
                    reader.finished = true;
                    reader.failure = Some(anyhow!("reply stream interrupted: {e}"));
                }
                None => {
                    let rest = String::from_utf8_lossy(&reader.buffer).to_string();
                    reader.buffer.clear();
                    reader.accept(&rest);
                    if !reader.saw_done && reader.failure.is_none() {
                        reader.failure = Some(anyhow!("reply stream ended before [DONE]"));
                    }
                    reader.finished = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_are_classified() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"你好"}}]}"#),
            SseLine::Fragment("你好".to_string())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": OPENROUTER PROCESSING"), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":""}}]}"#),
            SseLine::Skip
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Skip
        );
        assert_eq!(
            parse_sse_line(r#"data: {"error":{"message":"rate limited"}}"#),
            SseLine::Failed("rate limited".to_string())
        );
        assert_eq!(
            parse_sse_line(r#"data: {"error":"boom"}"#),
            SseLine::Failed("\"boom\"".to_string())
        );
    }

    #[tokio::test]
    async fn fragments_survive_chunk_boundaries() {
        let first = "data: {\"choices\":[{\"delta\":{\"content\":\"【初步\"}}]}\n\ndata: {\"choi";
        let second = "ces\":[{\"delta\":{\"content\":\"判断】\"}}]}\n\ndata: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n";
        let chunks: Vec<reqwest::Result<Vec<u8>>> = vec![
            Ok(first.as_bytes().to_vec()),
            Ok(second.as_bytes().to_vec()),
        ];

        let fragments: Vec<String> = sse_fragments(stream::iter(chunks).boxed())
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(fragments, vec!["【初步", "判断】"]);
    }

    async fn drain(chunks: Vec<&'static str>) -> Vec<anyhow::Result<String>> {
        let chunks: Vec<reqwest::Result<Vec<u8>>> =
            chunks.into_iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        sse_fragments(stream::iter(chunks).boxed()).collect().await
    }

    #[tokio::test]
    async fn body_ending_without_done_is_an_interruption() {
        let items = drain(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"【初步判断】\"}}]}\n\n",
        ])
        .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "【初步判断】");
        assert!(items[1].as_ref().unwrap_err().to_string().contains("[DONE]"));
    }

    #[tokio::test]
    async fn done_without_trailing_newline_still_completes() {
        let items = drain(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"好\"}}]}\n\n",
            "data: [DONE]",
        ])
        .await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), "好");
    }

    #[tokio::test]
    async fn provider_error_payload_ends_the_stream() {
        let items = drain(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"部分\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"upstream overloaded\",\"code\":502}}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\ndata: [DONE]\n\n",
        ])
        .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "部分");
        assert!(
            items[1]
                .as_ref()
                .unwrap_err()
                .to_string()
                .contains("upstream overloaded")
        );
    }

    #[test]
    fn message_text_accepts_part_lists() {
        let content = json!([{"type": "text", "text": "第一行"}, {"type": "text", "text": "第二行"}]);
        assert_eq!(message_text(&content).as_deref(), Some("第一行\n第二行"));
        assert_eq!(message_text(&Value::Null), None);
    }
}
