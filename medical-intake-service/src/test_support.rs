//! Deterministic in-process model double for stage and pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::llm::{CallOptions, FragmentStream, ModelClient};
use crate::models::StageKey;

/// How the reply stream behaves
#[derive(Debug, Clone)]
pub enum StreamScript {
    Fragments(Vec<String>),
    /// Yields the fragments, then fails
    Interrupted(Vec<String>),
    /// The stream call itself fails
    Refused,
}

/// Answers each stage from a queue of scripted replies. An exhausted queue answers
/// with an empty string, which the stages treat as "nothing learned".
pub struct ScriptedModel {
    replies: Mutex<HashMap<StageKey, VecDeque<anyhow::Result<String>>>>,
    delays: HashMap<StageKey, Duration>,
    stream: StreamScript,
    calls: Mutex<HashMap<StageKey, usize>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            delays: HashMap::new(),
            stream: StreamScript::Fragments(Vec::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_json(self, stage: StageKey, value: Value) -> Self {
        self.with_text(stage, value.to_string())
    }

    pub fn with_text(mut self, stage: StageKey, text: impl Into<String>) -> Self {
        self.queue(stage).push_back(Ok(text.into()));
        self
    }

    pub fn with_failure(mut self, stage: StageKey) -> Self {
        self.queue(stage)
            .push_back(Err(anyhow!("upstream 503 for {stage}")));
        self
    }

    pub fn with_delay(mut self, stage: StageKey, delay: Duration) -> Self {
        self.delays.insert(stage, delay);
        self
    }

    pub fn with_stream(mut self, script: StreamScript) -> Self {
        self.stream = script;
        self
    }

    pub fn calls(&self, stage: StageKey) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&stage)
            .copied()
            .unwrap_or(0)
    }

    fn queue(&mut self, stage: StageKey) -> &mut VecDeque<anyhow::Result<String>> {
        self.replies.get_mut().unwrap().entry(stage).or_default()
    }

    async fn enter(&self, stage: StageKey) {
        *self.calls.lock().unwrap().entry(stage).or_insert(0) += 1;
        if let Some(delay) = self.delays.get(&stage) {
            tokio::time::sleep(*delay).await;
        }
    }
}

fn stage_of(system_prompt: &str) -> StageKey {
    if system_prompt.contains("询问智能体") {
        StageKey::Intake
    } else if system_prompt.contains("路由智能体") {
        StageKey::Router
    } else if system_prompt.contains("专科智能体") {
        StageKey::Specialist
    } else if system_prompt.contains("Summary Agent") {
        StageKey::SummaryStructured
    } else {
        StageKey::SummaryReply
    }
}

fn ok_items(fragments: &[String]) -> Vec<anyhow::Result<String>> {
    fragments.iter().cloned().map(Ok).collect()
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(
        &self,
        system_prompt: &str,
        _user_prompt: &str,
        _options: CallOptions,
    ) -> anyhow::Result<String> {
        let stage = stage_of(system_prompt);
        self.enter(stage).await;
        let next = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&stage)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| Ok(String::new()))
    }

    async fn stream(
        &self,
        system_prompt: &str,
        _user_prompt: &str,
        options: CallOptions,
    ) -> anyhow::Result<FragmentStream> {
        assert_eq!(options, CallOptions::reply_stream());
        self.enter(stage_of(system_prompt)).await;

        match &self.stream {
            StreamScript::Fragments(fragments) => Ok(stream::iter(ok_items(fragments)).boxed()),
            StreamScript::Interrupted(fragments) => {
                let mut items = ok_items(fragments);
                items.push(Err(anyhow!("connection reset by peer")));
                Ok(stream::iter(items).boxed())
            }
            StreamScript::Refused => Err(anyhow!("stream refused")),
        }
    }
}
