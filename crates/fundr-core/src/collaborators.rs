//! External collaborator seams: language model, search index, progress channel.
//!
//! Each is constructed once at startup and handed to components as an `Arc<dyn _>`,
//! so tests substitute doubles without touching the pipeline.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{ModelError, SearchError};
use crate::profile::Stage;

/// What a prompt asks the model to do. Rendered as the first prompt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTask {
    SpamScreen,
    DetectLanguage,
    ClassifyIntent,
    ExtractFacts,
    Deflect,
    Mentor,
}

impl ModelTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTask::SpamScreen => "spam_screen",
            ModelTask::DetectLanguage => "detect_language",
            ModelTask::ClassifyIntent => "classify_intent",
            ModelTask::ExtractFacts => "extract_facts",
            ModelTask::Deflect => "deflect",
            ModelTask::Mentor => "mentor",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        [
            ModelTask::SpamScreen,
            ModelTask::DetectLanguage,
            ModelTask::ClassifyIntent,
            ModelTask::ExtractFacts,
            ModelTask::Deflect,
            ModelTask::Mentor,
        ]
        .into_iter()
        .find(|t| t.as_str() == s.trim())
    }
}

/// Renders a prompt as a task header, free-form instructions, then `### NAME` sections.
pub fn render_prompt(task: ModelTask, instructions: &str, sections: &[(&str, &str)]) -> String {
    let mut out = format!("TASK: {}\n{}\n", task.as_str(), instructions.trim());
    for (name, body) in sections {
        out.push_str(&format!("\n### {}\n{}\n", name.to_uppercase(), body.trim()));
    }
    out
}

/// Task named in a prompt's header line.
pub fn prompt_task(prompt: &str) -> Option<ModelTask> {
    prompt
        .lines()
        .next()
        .and_then(|l| l.strip_prefix("TASK:"))
        .and_then(ModelTask::parse)
}

/// Body of the `### NAME` section of a rendered prompt.
pub fn prompt_section<'a>(prompt: &'a str, name: &str) -> Option<&'a str> {
    let header = format!("### {}\n", name.to_uppercase());
    let start = prompt.find(&header)? + header.len();
    let rest = &prompt[start..];
    let end = rest.find("\n### ").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// Language-model service. Both calls may fail or time out; callers handle both.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Structured call: the model must answer with a JSON object.
    async fn classify(&self, prompt: &str) -> Result<serde_json::Value, ModelError>;

    /// Free-text generation.
    async fn generate(&self, prompt: &str) -> Result<String, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchKind {
    Investors,
    Companies,
}

/// Profile fields handed to the search index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub categories: Vec<String>,
    pub stage: Option<Stage>,
    #[serde(default)]
    pub problem_context: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCandidate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Relevance assigned by the index; higher first.
    #[serde(default)]
    pub score: f64,
}

/// Read-only ranked search over investors and service companies.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn query(&self, kind: SearchKind, query: &SearchQuery) -> Result<Vec<SearchCandidate>, SearchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Screening,
    Classifying,
    Searching,
    Generating,
    Done,
    Failed,
}

/// Observational progress text pushed to the user while a turn runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: ProgressPhase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ProgressEvent {
    pub fn new(phase: ProgressPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            correlation_id: None,
        }
    }
}

/// Best-effort, fire-and-forget progress sink. Must never fail the caller.
pub trait ProgressChannel: Send + Sync {
    fn emit(&self, user_id: &str, event: ProgressEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressChannel for NoopProgress {
    fn emit(&self, _user_id: &str, _event: ProgressEvent) {}
}

/// Per-user broadcast channels; events with no subscriber are dropped.
pub struct BroadcastProgress {
    channels: DashMap<String, broadcast::Sender<ProgressEvent>>,
    capacity: usize,
}

impl BroadcastProgress {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<ProgressEvent> {
        self.channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl Default for BroadcastProgress {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ProgressChannel for BroadcastProgress {
    fn emit(&self, user_id: &str, event: ProgressEvent) {
        let stale = match self.channels.get(user_id) {
            Some(tx) => tx.send(event).is_err() && tx.receiver_count() == 0,
            None => false,
        };
        if stale {
            self.channels.remove_if(user_id, |_, tx| tx.receiver_count() == 0);
        }
    }
}
