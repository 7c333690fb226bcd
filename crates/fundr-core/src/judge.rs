//! Intent classifier (judge) and the decision policy applied to its output.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::collaborators::{render_prompt, LanguageModel, ModelTask};
use crate::decision::{Action, ActionKind, CompanyQuery, Decision, FactCandidate, FactCandidates, InvestorQuery};
use crate::error::ModelError;
use crate::gate::Language;
use crate::profile::{normalize_category, FactKey, FactValue, ProfileField, Stage};
use crate::shared::JudgeConfig;
use crate::store::{ConversationTurn, Role, StoredProfile};

/// Clarifying questions asked per turn, at most.
const MAX_QUESTIONS: usize = 3;

/// Confidence assumed for an extracted fact that came without one.
const DEFAULT_FACT_CONFIDENCE: u8 = 50;

/// Localized question for a missing profile section.
pub fn question_for(field: ProfileField, language: Language) -> &'static str {
    let es = language.reply_language() == Language::Spanish;
    match (field, es) {
        (ProfileField::Categories, true) => "¿En qué industria o sector opera tu startup?",
        (ProfileField::Categories, false) => "Which industry or sector does your startup operate in?",
        (ProfileField::Stage, true) => "¿En qué etapa está tu proyecto (idea, MVP, semilla, serie A...)?",
        (ProfileField::Stage, false) => "What stage is your project at (idea, MVP, seed, series A...)?",
        (ProfileField::Metrics, true) => "¿Qué métricas tienes hoy: ingresos, usuarios y crecimiento mensual?",
        (ProfileField::Metrics, false) => "What are your current metrics: revenue, users and monthly growth?",
        (ProfileField::Team, true) => "¿Cuántas personas forman el equipo y qué experiencia tienen?",
        (ProfileField::Team, false) => "How many people are on the team and what is their background?",
        (ProfileField::Problem, true) => "¿Qué problema resuelves y para quién?",
        (ProfileField::Problem, false) => "What problem are you solving, and for whom?",
        (ProfileField::Product, true) => "¿En qué estado está tu producto?",
        (ProfileField::Product, false) => "Where is your product today?",
        (ProfileField::Funding, true) => "¿Has levantado financiación antes? ¿Cuánto y en qué ronda?",
        (ProfileField::Funding, false) => "Have you raised money before? How much, and in which round?",
    }
}

/// Questions for the highest-weight missing sections.
pub fn required_questions(missing: &[ProfileField], language: Language) -> Vec<String> {
    let mut questions: Vec<String> = missing
        .iter()
        .take(MAX_QUESTIONS)
        .map(|f| question_for(*f, language).to_string())
        .collect();
    if questions.is_empty() {
        questions.push(match language.reply_language() {
            Language::Spanish => "¿En qué puedo ayudarte hoy con tu proyecto?".to_string(),
            _ => "How can I help you with your project today?".to_string(),
        });
    }
    questions
}

/// Loosely-typed classifier output, validated into a [`Decision`] immediately.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDecision {
    scores: HashMap<String, f64>,
    action: Option<String>,
    confidence: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    facts: serde_json::Map<String, Value>,
    #[serde(deserialize_with = "lenient")]
    spam: bool,
    #[serde(deserialize_with = "lenient")]
    reasoning: String,
    #[serde(deserialize_with = "lenient")]
    topic: Option<String>,
    #[serde(deserialize_with = "lenient")]
    problem_context: Option<String>,
    #[serde(deserialize_with = "lenient")]
    questions: Vec<String>,
}

/// Null or mistyped auxiliary fields read as their default instead of failing the whole answer.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::de::DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn clamp_score(v: f64) -> u8 {
    v.clamp(0.0, 100.0).round() as u8
}

fn parse_fact_value(key: FactKey, raw: &Value) -> Option<FactValue> {
    let value = match raw {
        Value::Object(obj) if obj.contains_key("value") => &obj["value"],
        other => other,
    };
    match key {
        FactKey::Categories => {
            let tags: BTreeSet<String> = match value {
                Value::Array(items) => items.iter().filter_map(|v| v.as_str()).map(normalize_category).collect(),
                Value::String(s) => s.split(',').map(normalize_category).collect(),
                _ => BTreeSet::new(),
            };
            let tags: BTreeSet<String> = tags.into_iter().filter(|t| !t.is_empty()).collect();
            (!tags.is_empty()).then_some(FactValue::Categories(tags))
        }
        FactKey::Stage => value.as_str().and_then(Stage::parse).map(FactValue::Stage),
        _ => match value {
            Value::String(s) if !s.trim().is_empty() => Some(FactValue::Text(s.trim().to_string())),
            Value::Number(n) => Some(FactValue::Text(n.to_string())),
            _ => None,
        },
    }
}

/// Validates the `facts` object of a model answer. Unknown keys and unusable values are dropped.
pub fn parse_facts(facts: &serde_json::Map<String, Value>) -> FactCandidates {
    let mut out = FactCandidates::new();
    for (name, raw) in facts {
        let Some(key) = FactKey::parse(name) else {
            tracing::debug!(target: "fundr::judge", fact = %name, "dropping unknown fact key");
            continue;
        };
        let Some(value) = parse_fact_value(key, raw) else {
            continue;
        };
        let confidence = raw
            .get("confidence")
            .and_then(|c| c.as_f64())
            .map(clamp_score)
            .unwrap_or(DEFAULT_FACT_CONFIDENCE);
        out.insert(key, FactCandidate { value, confidence });
    }
    out
}

pub struct Judge {
    model: Arc<dyn LanguageModel>,
    config: JudgeConfig,
}

impl Judge {
    pub fn new(model: Arc<dyn LanguageModel>, config: JudgeConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    fn build_prompt(&self, text: &str, history: &[ConversationTurn], profile: &StoredProfile, language: Language) -> String {
        let start = history.len().saturating_sub(self.config.history_window);
        let history_text = history[start..]
            .iter()
            .map(|t| {
                let role = match t.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                format!("{}: {}", role, t.text)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let actions = ActionKind::all().map(|a| a.as_str()).join(", ");
        let instructions = format!(
            "You route messages for a startup fundraising assistant. Score every action from 0 to 100: {actions}. \
             Extract any project facts you can (keys: {keys}) with a confidence from 0 to 100 each. \
             Answer as JSON: {{\"scores\": {{action: score}}, \"facts\": {{key: {{\"value\": ..., \"confidence\": n}}}}, \
             \"spam\": bool, \"topic\": string, \"problem_context\": string, \"questions\": [string], \"reasoning\": string}}.\n{lang}",
            actions = actions,
            keys = FactKey::all().map(|k| k.as_str()).join(", "),
            lang = language.instructions(),
        );
        let completeness = profile.completeness.total.to_string();
        render_prompt(
            ModelTask::ClassifyIntent,
            &instructions,
            &[
                ("message", text),
                ("history", &history_text),
                ("profile", &profile.profile.summary()),
                ("completeness", &completeness),
            ],
        )
    }

    /// Calls the model under the hard timeout and validates its answer.
    pub async fn classify(
        &self,
        text: &str,
        history: &[ConversationTurn],
        profile: &StoredProfile,
        language: Language,
    ) -> Result<Decision, ModelError> {
        let prompt = self.build_prompt(text, history, profile, language);
        let timeout = Duration::from_millis(self.config.model_timeout_ms);
        let raw = match tokio::time::timeout(timeout, self.model.classify(&prompt)).await {
            Ok(result) => result?,
            Err(_) => return Err(ModelError::Timeout(self.config.model_timeout_ms)),
        };
        let raw: RawDecision = serde_json::from_value(raw).map_err(|e| ModelError::Parse(e.to_string()))?;
        Ok(self.validate(raw, text, profile, language))
    }

    /// Classifies, failing closed to a free clarification on any model error.
    pub async fn decide(
        &self,
        text: &str,
        history: &[ConversationTurn],
        profile: &StoredProfile,
        language: Language,
    ) -> Decision {
        match self.classify(text, history, profile, language).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(target: "fundr::judge", error = %e, "classification failed, falling back to clarification");
                Decision::fail_closed(required_questions(&profile.completeness.missing, language))
            }
        }
    }

    /// Picks the winning action from per-action scores.
    ///
    /// Below `min_viable_score` nothing is viable and clarification wins. When the
    /// top two are within `clarify_epsilon` and one is clarification, it wins.
    pub fn select_action(&self, scores: &HashMap<ActionKind, u8>) -> (ActionKind, u8) {
        let mut viable: Vec<(ActionKind, u8)> = scores
            .iter()
            .filter(|(_, s)| **s >= self.config.min_viable_score)
            .map(|(k, s)| (*k, *s))
            .collect();
        // Deterministic ordering: score desc, then the cheaper/safer kind first.
        viable.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| safety_rank(a.0).cmp(&safety_rank(b.0))));

        match viable.as_slice() {
            [] => {
                let best = scores.values().copied().max().unwrap_or(0);
                (ActionKind::AskClarifyingQuestions, best)
            }
            [only] => *only,
            [first, second, ..] => {
                let close = first.1.saturating_sub(second.1) <= self.config.clarify_epsilon;
                if close && second.0 == ActionKind::AskClarifyingQuestions {
                    *second
                } else {
                    *first
                }
            }
        }
    }

    fn validate(&self, raw: RawDecision, text: &str, profile: &StoredProfile, language: Language) -> Decision {
        let mut scores: HashMap<ActionKind, u8> = raw
            .scores
            .iter()
            .filter_map(|(k, v)| ActionKind::parse(k).map(|kind| (kind, clamp_score(*v))))
            .collect();
        if let Some(kind) = raw.action.as_deref().and_then(ActionKind::parse) {
            let conf = raw.confidence.map(clamp_score).unwrap_or(self.config.min_viable_score);
            let entry = scores.entry(kind).or_insert(conf);
            *entry = (*entry).max(conf);
        }

        let facts = parse_facts(&raw.facts);
        let (kind, confidence) = if raw.spam {
            (ActionKind::RejectSpam, scores.get(&ActionKind::RejectSpam).copied().unwrap_or(100))
        } else {
            self.select_action(&scores)
        };

        let categories = || {
            let mut cats: BTreeSet<String> = profile.profile.categories.clone();
            if let Some(FactCandidate { value: FactValue::Categories(extra), .. }) = facts.get(&FactKey::Categories) {
                cats.extend(extra.iter().cloned());
            }
            cats.into_iter().collect::<Vec<_>>()
        };

        let action = match kind {
            ActionKind::SearchInvestors => {
                let stage = match facts.get(&FactKey::Stage) {
                    Some(FactCandidate { value: FactValue::Stage(s), .. }) => Some(*s),
                    _ => profile.profile.stage,
                };
                Action::SearchInvestors(InvestorQuery {
                    categories: categories(),
                    stage,
                })
            }
            ActionKind::SearchCompanies => Action::SearchCompanies(CompanyQuery {
                problem_context: raw
                    .problem_context
                    .clone()
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or_else(|| text.trim().to_string()),
                categories: categories(),
            }),
            ActionKind::Mentor => Action::Mentor {
                topic: raw
                    .topic
                    .clone()
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| text.trim().to_string()),
            },
            ActionKind::AskClarifyingQuestions => {
                let mut questions: Vec<String> = raw
                    .questions
                    .iter()
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .take(MAX_QUESTIONS)
                    .collect();
                if questions.is_empty() {
                    questions = required_questions(&profile.completeness.missing, language);
                }
                Action::clarify(questions)
            }
            ActionKind::RejectSpam => Action::RejectSpam,
            ActionKind::CreateOrUpdateProject => Action::CreateOrUpdateProject,
        };

        tracing::debug!(
            target: "fundr::judge",
            action = %kind,
            confidence,
            facts = facts.len(),
            "classified message"
        );

        Decision {
            action,
            confidence,
            facts,
            spam: raw.spam,
            reasoning: raw.reasoning,
            original_intent: None,
            fallback: false,
        }
    }

    /// Downgrades a search to clarification when the profile is not complete enough,
    /// recording the original intent.
    pub fn gate_search(&self, mut decision: Decision, profile: &StoredProfile, language: Language) -> Decision {
        let kind = decision.kind();
        let completeness = profile.completeness.total;
        if kind.is_search() && completeness < self.config.min_completeness_for_search {
            tracing::info!(
                target: "fundr::judge",
                original_intent = %kind,
                completeness,
                threshold = self.config.min_completeness_for_search,
                "search downgraded to clarification"
            );
            decision.original_intent = Some(kind);
            decision.action = Action::clarify(required_questions(&profile.completeness.missing, language));
        }
        decision
    }
}

/// Lower is cheaper and safer.
fn safety_rank(kind: ActionKind) -> u8 {
    match kind {
        ActionKind::RejectSpam => 0,
        ActionKind::AskClarifyingQuestions => 1,
        ActionKind::CreateOrUpdateProject => 2,
        ActionKind::Mentor => 3,
        ActionKind::SearchCompanies => 4,
        ActionKind::SearchInvestors => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedModel {
        answer: Result<Value, ModelError>,
        delay_ms: u64,
        calls: AtomicU32,
    }

    impl ScriptedModel {
        fn ok(answer: Value) -> Self {
            Self { answer: Ok(answer), delay_ms: 0, calls: AtomicU32::new(0) }
        }
    }

    #[async_trait::async_trait]
    impl LanguageModel for ScriptedModel {
        async fn classify(&self, _prompt: &str) -> Result<Value, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.answer.clone()
        }
        async fn generate(&self, _prompt: &str) -> Result<String, ModelError> {
            Ok(String::new())
        }
    }

    fn judge(model: ScriptedModel) -> Judge {
        Judge::new(Arc::new(model), JudgeConfig::default())
    }

    fn seeded_profile() -> StoredProfile {
        let mut p = crate::profile::ProjectProfile::default();
        p.categories.insert("fintech".into());
        p.stage = Some(Stage::Seed);
        StoredProfile::empty().next(p)
    }

    #[tokio::test]
    async fn picks_highest_viable_action_with_typed_payload() {
        let j = judge(ScriptedModel::ok(json!({
            "scores": {"search_investors": 85, "mentor": 40},
            "facts": {"categories": {"value": ["Insurtech"], "confidence": 70}}
        })));
        let d = j.classify("find me seed investors", &[], &seeded_profile(), Language::English).await.unwrap();
        match d.action {
            Action::SearchInvestors(q) => {
                assert_eq!(q.stage, Some(Stage::Seed));
                assert_eq!(q.categories, vec!["fintech".to_string(), "insurtech".to_string()]);
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(d.confidence, 85);
    }

    #[tokio::test]
    async fn null_or_mistyped_facts_do_not_fail_the_answer() {
        for facts in [json!(null), json!("stage: seed"), json!(["fintech"])] {
            let j = judge(ScriptedModel::ok(json!({
                "scores": {"search_investors": 85},
                "facts": facts,
                "questions": null,
                "topic": 7
            })));
            let d = j.classify("find me seed investors", &[], &seeded_profile(), Language::English).await.unwrap();
            assert_eq!(d.action.kind(), ActionKind::SearchInvestors);
            assert!(d.facts.is_empty());
        }
    }

    #[test]
    fn near_tie_prefers_clarification() {
        let j = judge(ScriptedModel::ok(json!({})));
        let scores = HashMap::from([
            (ActionKind::SearchInvestors, 72),
            (ActionKind::AskClarifyingQuestions, 68),
        ]);
        assert_eq!(j.select_action(&scores).0, ActionKind::AskClarifyingQuestions);

        let scores = HashMap::from([
            (ActionKind::SearchInvestors, 80),
            (ActionKind::AskClarifyingQuestions, 60),
        ]);
        assert_eq!(j.select_action(&scores).0, ActionKind::SearchInvestors);
    }

    #[test]
    fn nothing_viable_means_clarification() {
        let j = judge(ScriptedModel::ok(json!({})));
        let scores = HashMap::from([(ActionKind::Mentor, 20)]);
        assert_eq!(j.select_action(&scores), (ActionKind::AskClarifyingQuestions, 20));
    }

    #[tokio::test]
    async fn timeout_fails_closed() {
        let model = ScriptedModel {
            answer: Ok(json!({"scores": {"search_investors": 99}})),
            delay_ms: 200,
            calls: AtomicU32::new(0),
        };
        let j = Judge::new(
            Arc::new(model),
            JudgeConfig {
                model_timeout_ms: 20,
                ..JudgeConfig::default()
            },
        );
        let d = j.decide("investors please", &[], &seeded_profile(), Language::English).await;
        assert!(d.fallback);
        assert_eq!(d.kind(), ActionKind::AskClarifyingQuestions);
    }

    #[tokio::test]
    async fn provider_error_and_garbage_fail_closed() {
        let j = judge(ScriptedModel {
            answer: Err(ModelError::Provider("500".into())),
            delay_ms: 0,
            calls: AtomicU32::new(0),
        });
        let d = j.decide("hi", &[], &StoredProfile::empty(), Language::Spanish).await;
        assert!(d.fallback);
        match d.action {
            Action::AskClarifyingQuestions { questions } => {
                assert_eq!(questions.len(), 3);
                assert!(questions[0].contains("industria"));
            }
            other => panic!("unexpected action {other:?}"),
        }

        let j = judge(ScriptedModel::ok(json!("not an object")));
        assert!(j.decide("hi", &[], &StoredProfile::empty(), Language::English).await.fallback);
    }

    #[tokio::test]
    async fn search_downgraded_on_empty_profile() {
        let j = judge(ScriptedModel::ok(json!({"scores": {"search_investors": 95}})));
        let profile = StoredProfile::empty();
        let d = j.classify("I need investors", &[], &profile, Language::English).await.unwrap();
        assert_eq!(d.kind(), ActionKind::SearchInvestors);
        let d = j.gate_search(d, &profile, Language::English);
        assert_eq!(d.kind(), ActionKind::AskClarifyingQuestions);
        assert_eq!(d.original_intent, Some(ActionKind::SearchInvestors));
    }

    #[tokio::test]
    async fn search_allowed_at_exactly_fifty() {
        let j = judge(ScriptedModel::ok(json!({"scores": {"search_companies": 90}})));
        let profile = seeded_profile();
        assert_eq!(profile.completeness.total, 50);
        let d = j.classify("I need a law firm", &[], &profile, Language::English).await.unwrap();
        let d = j.gate_search(d, &profile, Language::English);
        assert_eq!(d.kind(), ActionKind::SearchCompanies);
        assert_eq!(d.original_intent, None);
    }

    #[test]
    fn parse_facts_validates_values() {
        let raw = json!({
            "stage": {"value": "Series A", "confidence": 120},
            "metrics.users": {"value": 1500, "confidence": 60},
            "categories": "fintech, ,  SaaS",
            "favorite_color": {"value": "blue"},
            "problem": {"value": "   "}
        });
        let facts = parse_facts(raw.as_object().unwrap());
        assert_eq!(facts[&FactKey::Stage].value, FactValue::Stage(Stage::SeriesA));
        assert_eq!(facts[&FactKey::Stage].confidence, 100);
        assert_eq!(facts[&FactKey::Users].value, FactValue::Text("1500".into()));
        assert_eq!(facts[&FactKey::Categories].confidence, DEFAULT_FACT_CONFIDENCE);
        assert!(!facts.contains_key(&FactKey::Problem));
        assert_eq!(facts.len(), 3);
    }
}
