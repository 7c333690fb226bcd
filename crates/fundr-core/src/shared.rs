//! Shared types and configuration used across all fundr crates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::decision::ActionKind;

/// Subscription tier of a user. Changes allowances and costs, never meter logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Outreach,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Outreach => "outreach",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "free" => Some(Plan::Free),
            "pro" => Some(Plan::Pro),
            "outreach" => Some(Plan::Outreach),
            _ => None,
        }
    }
}

/// Identity of a single conversational turn, handed to every action skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnContext {
    pub user_id: String,
    pub project_id: String,
    pub plan: Plan,
    /// Optional correlation id for request tracing.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl TurnContext {
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>, plan: Plan) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
            plan,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Anti-spam / language gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// `is_spam = spam_score >= spam_threshold`.
    pub spam_threshold: u8,
    /// Window in which repeated messages from one user count against them.
    pub repetition_window_secs: u64,
    /// Repeats inside the window before the repetition criterion saturates.
    pub repetition_limit: u32,
    /// Ask the language model for a second opinion on spam and language.
    pub model_screening: bool,
    /// Hard timeout on each screening call; on elapse the heuristics decide.
    pub model_timeout_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            spam_threshold: 80,
            repetition_window_secs: 600,
            repetition_limit: 3,
            model_screening: true,
            model_timeout_ms: 5_000,
        }
    }
}

/// Intent classifier and decision policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    /// Number of prior turns handed to the classifier.
    pub history_window: usize,
    /// Actions scoring below this are not viable.
    pub min_viable_score: u8,
    /// Top-two gap under which clarification wins over a search.
    pub clarify_epsilon: u8,
    /// Searches are only eligible at or above this completeness.
    pub min_completeness_for_search: u8,
    /// Hard timeout on the classification call.
    pub model_timeout_ms: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            history_window: 5,
            min_viable_score: 30,
            clarify_epsilon: 5,
            min_completeness_for_search: 50,
            model_timeout_ms: 8_000,
        }
    }
}

/// Background reconciler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Optimistic-concurrency retries before a job is dropped.
    pub max_retries: u32,
    /// Bounded work queue size; enqueue fails fast when full.
    pub queue_capacity: usize,
    /// Re-ask the model for facts beyond what the judge proposed.
    pub enrichment: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            queue_capacity: 256,
            enrichment: true,
        }
    }
}

/// Allowances and per-action costs for one plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Total balance granted at account creation. `None` = unlimited.
    #[serde(default)]
    pub balance: Option<u64>,
    /// Credits that may be committed or held within one 24h window.
    pub daily_allowance: u64,
    /// Maximum cost per action kind (keys are action labels).
    #[serde(default)]
    pub costs: HashMap<String, u64>,
}

impl PlanLimits {
    fn with_costs(balance: Option<u64>, daily_allowance: u64, costs: [(ActionKind, u64); 3]) -> Self {
        Self {
            balance,
            daily_allowance,
            costs: costs
                .into_iter()
                .map(|(kind, cost)| (kind.as_str().to_string(), cost))
                .collect(),
        }
    }

    pub fn free() -> Self {
        Self::with_costs(
            Some(200),
            50,
            [
                (ActionKind::SearchInvestors, 50),
                (ActionKind::SearchCompanies, 25),
                (ActionKind::Mentor, 5),
            ],
        )
    }

    pub fn pro() -> Self {
        Self::with_costs(
            None,
            150,
            [
                (ActionKind::SearchInvestors, 20),
                (ActionKind::SearchCompanies, 10),
                (ActionKind::Mentor, 0),
            ],
        )
    }

    pub fn outreach() -> Self {
        Self::with_costs(
            None,
            200,
            [
                (ActionKind::SearchInvestors, 10),
                (ActionKind::SearchCompanies, 5),
                (ActionKind::Mentor, 0),
            ],
        )
    }

    /// Maximum cost of `kind` under this plan. Unlisted actions are free.
    pub fn cost_of(&self, kind: ActionKind) -> u64 {
        self.costs.get(kind.as_str()).copied().unwrap_or(0)
    }
}

/// Credit meter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditConfig {
    /// Reservations not committed within this time are auto-released.
    pub reservation_ttl_secs: u64,
    #[serde(default = "PlanLimits::free")]
    pub free: PlanLimits,
    #[serde(default = "PlanLimits::pro")]
    pub pro: PlanLimits,
    #[serde(default = "PlanLimits::outreach")]
    pub outreach: PlanLimits,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: 300,
            free: PlanLimits::free(),
            pro: PlanLimits::pro(),
            outreach: PlanLimits::outreach(),
        }
    }
}

impl CreditConfig {
    pub fn limits(&self, plan: Plan) -> &PlanLimits {
        match plan {
            Plan::Free => &self.free,
            Plan::Pro => &self.pro,
            Plan::Outreach => &self.outreach,
        }
    }
}

/// Upsell advisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpsellConfig {
    pub enabled: bool,
    /// User turns that must pass between two suggestions.
    pub cooldown_turns: u32,
    /// Hours that must pass between two suggestions.
    pub cooldown_hours: u32,
    /// Suggestions allowed per user per rolling 24h.
    pub daily_cap: u32,
    /// A suggestion fires only when its confidence exceeds this.
    pub min_confidence: u8,
}

impl Default for UpsellConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_turns: 3,
            cooldown_hours: 4,
            daily_cap: 3,
            min_confidence: 80,
        }
    }
}

/// Global application configuration (gateway + engine). Load from TOML or env.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Application identity shown by the status endpoint.
    pub app_name: String,
    /// HTTP port for the gateway.
    pub port: u16,
    /// Base directory for the sled database.
    pub storage_path: String,
    /// LLM mode ("mock" or "live").
    pub llm_mode: String,
    /// OpenAI-compatible chat completions endpoint used in live mode.
    #[serde(default)]
    pub llm_api_url: Option<String>,
    #[serde(default)]
    pub llm_model: Option<String>,
    /// JSON dataset backing the search index. Empty index when unset.
    #[serde(default)]
    pub search_dataset_path: Option<String>,

    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub credit: CreditConfig,
    #[serde(default)]
    pub upsell: UpsellConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            app_name: "Fundr Gateway".to_string(),
            port: 8001,
            storage_path: "./data".to_string(),
            llm_mode: "mock".to_string(),
            llm_api_url: None,
            llm_model: None,
            search_dataset_path: None,
            gate: GateConfig::default(),
            judge: JudgeConfig::default(),
            reconciler: ReconcilerConfig::default(),
            credit: CreditConfig::default(),
            upsell: UpsellConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load config from file and environment. Precedence: env `FUNDR_CONFIG` path > `config/gateway.toml` > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path = std::env::var("FUNDR_CONFIG").unwrap_or_else(|_| "config/gateway".to_string());
        let builder = config::Config::builder()
            .set_default("app_name", "Fundr Gateway")?
            .set_default("port", 8001_i64)?
            .set_default("storage_path", "./data")?
            .set_default("llm_mode", "mock")?;

        let path = Path::new(&config_path);
        let with_ext = path.with_extension("toml");
        let builder = if path.is_file() {
            builder.add_source(config::File::from(path))
        } else if with_ext.is_file() {
            builder.add_source(config::File::from(with_ext.as_path()))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("FUNDR").separator("__"))
            .build()?;

        built.try_deserialize()
    }
}

/// Current time in unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Used by tests of windows and expiry.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: std::sync::atomic::AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: std::sync::atomic::AtomicI64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta: i64) {
        self.now.fetch_add(delta, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance_hours(&self, hours: i64) {
        self.advance_ms(hours * 3_600_000);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_costs_default_table() {
        let credit = CreditConfig::default();
        assert_eq!(credit.limits(Plan::Free).cost_of(ActionKind::SearchInvestors), 50);
        assert_eq!(credit.limits(Plan::Pro).cost_of(ActionKind::SearchCompanies), 10);
        assert_eq!(credit.limits(Plan::Free).cost_of(ActionKind::AskClarifyingQuestions), 0);
        assert_eq!(credit.limits(Plan::Outreach).balance, None);
    }

    #[test]
    fn plan_parse_is_case_insensitive() {
        assert_eq!(Plan::parse(" PRO "), Some(Plan::Pro));
        assert_eq!(Plan::parse("enterprise"), None);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance_hours(1);
        assert_eq!(clock.now_ms(), 3_601_000);
    }
}
