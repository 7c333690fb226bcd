//! Model Router: the engine's language model, either a deterministic mock or a live
//! OpenAI-compatible chat completions API.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Duration;

use fundr_core::gate::{detect_language_heuristic, heuristic_spam_score};
use fundr_core::shared::GateConfig;
use fundr_core::{prompt_section, prompt_task, CoreConfig, Language, LanguageModel, ModelError, ModelTask, Stage};

const ENV_LLM_API_KEY: &str = "FUNDR_LLM_API_KEY";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const HTTP_TIMEOUT_SECS: u64 = 30;

/// Mode for LLM invocation: mock (deterministic keyword routing) or live (external API).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LlmMode {
    #[default]
    Mock,
    Live,
}

impl LlmMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "live" => LlmMode::Live,
            _ => LlmMode::Mock,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LlmMode::Mock => "mock",
            LlmMode::Live => "live",
        }
    }
}

/// Category tags recognised by the mock extractor, with the words that signal them.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("fintech", &["fintech", "payments", "pagos", "banking", "banca", "lending", "préstamos"]),
    ("healthtech", &["healthtech", "health", "salud", "medical", "médic", "clinic"]),
    ("edtech", &["edtech", "education", "educación", "learning", "students", "alumnos"]),
    ("saas", &["saas", "b2b software", "subscription", "suscripción"]),
    ("marketplace", &["marketplace"]),
    ("ai", &["artificial intelligence", "inteligencia artificial", "machine learning", " ai ", " ia "]),
    ("ecommerce", &["ecommerce", "e-commerce", "online store", "tienda online"]),
    ("proptech", &["proptech", "real estate", "inmobiliari"]),
    ("agritech", &["agritech", "agtech", "agricultur"]),
    ("climate", &["climate", "clima", "carbon", "carbono", "renewable", "renovable"]),
];

const INVESTOR_WORDS: &[&str] = &["investor", "inversor", "inversion", "inversión", " vc ", "angel", " fund ", " funds ", "fondo", "raise", "levantar", "financiación", "funding"];
const COMPANY_WORDS: &[&str] = &["agency", "agencia", "provider", "proveedor", "developer", "desarrollador", "lawyer", "abogado", "consultant", "consultor", "supplier", "outsourc"];
const MENTOR_WORDS: &[&str] = &["how", "cómo", "como", "advice", "consejo", "should", "debería", "pitch", "valuation", "valoración", "strategy", "estrategia", "help me", "ayúdame"];
const UPDATE_WORDS: &[&str] = &["we are", "we're", "our startup", "somos", "nuestra startup", "tenemos", "we have", "update", "actualiza"];

fn money_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)([€$]\s?\d[\d.,]*\s?[km]?|\d[\d.,]*\s?(k|m|mil|million|millones)?\s?(€|eur|euros|usd|dollars|dólares))").ok())
        .as_ref()
}

fn users_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d[\d.,]*\s?k?)\s+(users|usuarios|customers|clientes)").ok())
        .as_ref()
}

fn team_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s+(co-?founders|cofundadores|founders|fundadores|people|personas|employees|empleados)").ok())
        .as_ref()
}

fn contains_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

fn fact(value: Value, confidence: u8) -> Value {
    json!({ "value": value, "confidence": confidence })
}

/// Keyword and pattern based fact extraction used in mock mode.
fn mock_facts(text: &str) -> serde_json::Map<String, Value> {
    let lower = format!(" {} ", text.to_lowercase());
    let mut facts = serde_json::Map::new();

    let categories: BTreeSet<&str> = CATEGORY_KEYWORDS
        .iter()
        .filter(|(_, words)| contains_any(&lower, words))
        .map(|(tag, _)| *tag)
        .collect();
    if !categories.is_empty() {
        facts.insert("categories".into(), fact(json!(categories), 70));
    }

    let normalized = lower.replace(['-', '_'], " ");
    let stage = ["series a", "serie a", "series b", "serie b", "early revenue", "pre seed", "preseed"]
        .iter()
        .find(|p| normalized.contains(*p))
        .and_then(|p| Stage::parse(p))
        .or_else(|| {
            normalized
                .split(|c: char| !c.is_alphanumeric())
                .filter_map(Stage::parse)
                .find(|s| !matches!(s, Stage::Growth | Stage::EarlyRevenue))
        });
    if let Some(stage) = stage {
        facts.insert("stage".into(), fact(json!(stage.as_str()), 65));
    }

    if let Some(m) = users_pattern().and_then(|re| re.captures(text)) {
        facts.insert("metrics.users".into(), fact(json!(m[1].trim()), 60));
    }
    if let Some(m) = money_pattern().and_then(|re| re.find(text)) {
        let key = if contains_any(&lower, &["revenue", "factur", "ingres", "mrr", "arr"]) {
            "metrics.revenue"
        } else if contains_any(&lower, &["raise", "raising", "levantar", "buscamos", "round", "ronda"]) {
            "funding.amount"
        } else {
            "metrics.revenue"
        };
        facts.insert(key.into(), fact(json!(m.as_str().trim()), 55));
    }
    if let Some(m) = team_pattern().and_then(|re| re.captures(text)) {
        facts.insert("team.size".into(), fact(json!(m[1].trim()), 60));
    }
    if contains_any(&lower, &["problem", "problema", "pain", "struggle", "cuesta"]) && text.split_whitespace().count() >= 6 {
        facts.insert("problem".into(), fact(json!(text.trim()), 50));
    }
    facts
}

fn mock_scores(text: &str) -> Value {
    let lower = format!(" {} ", text.to_lowercase());
    let mut scores = serde_json::Map::new();
    scores.insert("ask_clarifying_questions".into(), json!(45));
    if contains_any(&lower, INVESTOR_WORDS) {
        scores.insert("search_investors".into(), json!(85));
    }
    if contains_any(&lower, COMPANY_WORDS) {
        scores.insert("search_companies".into(), json!(80));
    }
    if contains_any(&lower, MENTOR_WORDS) {
        scores.insert("mentor".into(), json!(70));
    }
    if contains_any(&lower, UPDATE_WORDS) {
        scores.insert("create_or_update_project".into(), json!(60));
    }
    Value::Object(scores)
}

fn prompt_language(prompt: &str) -> Language {
    if prompt.contains(Language::Spanish.instructions()) {
        Language::Spanish
    } else {
        Language::English
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageResponse,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Option<String>,
}

/// Routes prompts to a mock LLM or a live OpenAI-compatible API.
pub struct ModelRouter {
    mode: LlmMode,
    client: reqwest::Client,
    api_url: Option<String>,
    api_key: Option<String>,
    model: String,
}

impl ModelRouter {
    pub fn with_mode(mode: LlmMode) -> Self {
        Self {
            mode,
            client: reqwest::Client::new(),
            api_url: None,
            api_key: std::env::var(ENV_LLM_API_KEY).ok(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Builds the router from config. Live mode without an API URL falls back to mock.
    pub fn from_config(config: &CoreConfig) -> Self {
        let mut mode = LlmMode::parse(&config.llm_mode);
        if mode == LlmMode::Live && config.llm_api_url.is_none() {
            tracing::warn!(target: "fundr::skills", "llm_mode is live but llm_api_url is unset; using mock");
            mode = LlmMode::Mock;
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            mode,
            client,
            api_url: config.llm_api_url.clone(),
            api_key: std::env::var(ENV_LLM_API_KEY).ok(),
            model: config.llm_model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    pub fn mode(&self) -> LlmMode {
        self.mode
    }

    /// Mock structured call, dispatched on the prompt's task header.
    fn mock_classify(&self, prompt: &str) -> Result<Value, ModelError> {
        let task = prompt_task(prompt).ok_or_else(|| ModelError::Parse("prompt has no task header".into()))?;
        let message = prompt_section(prompt, "message").unwrap_or_default();
        match task {
            ModelTask::SpamScreen => {
                let (score, _) = heuristic_spam_score(message, &[], &GateConfig::default());
                Ok(json!({ "spam_score": score }))
            }
            ModelTask::DetectLanguage => Ok(json!({ "language": detect_language_heuristic(message).as_str() })),
            ModelTask::ClassifyIntent => Ok(json!({
                "scores": mock_scores(message),
                "facts": mock_facts(message),
                "problem_context": message,
                "topic": message,
                "reasoning": "keyword routing (mock)",
            })),
            ModelTask::ExtractFacts => {
                let text = prompt_section(prompt, "text").unwrap_or(message);
                Ok(json!({ "facts": mock_facts(text) }))
            }
            ModelTask::Deflect | ModelTask::Mentor => {
                Err(ModelError::Parse(format!("{} is a generation task", task.as_str())))
            }
        }
    }

    /// Mock free-text generation.
    fn mock_generate(&self, prompt: &str) -> String {
        let language = prompt_language(prompt);
        let es = language == Language::Spanish;
        match prompt_task(prompt) {
            Some(ModelTask::Mentor) => {
                let topic = prompt_section(prompt, "topic").unwrap_or_default();
                if es {
                    format!(
                        "Sobre \"{}\": céntrate en una métrica que demuestre tracción, cuantifica el problema que resuelves \
                         y prepara un relato claro de cómo usarás la inversión. Valida cada supuesto con clientes reales.",
                        topic
                    )
                } else {
                    format!(
                        "On \"{}\": focus on one metric that proves traction, quantify the problem you solve, \
                         and prepare a clear story of how you'll use the money. Validate every assumption with real customers.",
                        topic
                    )
                }
            }
            _ => language.deflection().to_string(),
        }
    }

    async fn live_chat(&self, prompt: &str, json_mode: bool) -> Result<String, ModelError> {
        let base = self
            .api_url
            .as_deref()
            .ok_or_else(|| ModelError::Provider("llm_api_url is not configured".into()))?;
        let url = format!("{}/chat/completions", base.trim_end_matches('/'));
        let system = if json_mode {
            "You are a startup fundraising assistant. Answer with a single JSON object and nothing else."
        } else {
            "You are a startup fundraising assistant."
        };
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: prompt },
            ],
            temperature: if json_mode { 0.0 } else { 0.4 },
            response_format: json_mode.then_some(ResponseFormat { format_type: "json_object" }),
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout(HTTP_TIMEOUT_SECS * 1_000)
            } else {
                ModelError::Provider(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ModelError::Provider(format!("{}: {}", status, detail.chars().take(200).collect::<String>())));
        }
        let parsed: ChatResponse = response.json().await.map_err(|e| ModelError::Parse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ModelError::Parse("empty completion".into()))
    }
}

/// Strips a markdown code fence some providers wrap JSON in.
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[async_trait]
impl LanguageModel for ModelRouter {
    async fn classify(&self, prompt: &str) -> Result<Value, ModelError> {
        match self.mode {
            LlmMode::Mock => self.mock_classify(prompt),
            LlmMode::Live => {
                let raw = self.live_chat(prompt, true).await?;
                let value: Value = serde_json::from_str(strip_fence(&raw)).map_err(|e| ModelError::Parse(e.to_string()))?;
                if value.is_object() {
                    Ok(value)
                } else {
                    Err(ModelError::Parse("expected a JSON object".into()))
                }
            }
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        match self.mode {
            LlmMode::Mock => Ok(self.mock_generate(prompt)),
            LlmMode::Live => self.live_chat(prompt, false).await.map(|s| s.trim().to_string()),
        }
    }
}
