//! Decision value objects produced by the judge and consumed by the orchestrator
//! and the reconciler.
//!
//! Model output is loosely typed JSON; it is validated into these types right at
//! the boundary (see [`crate::judge`]) so nothing downstream handles raw payloads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::profile::{FactKey, FactValue, Stage};

/// Label of an action, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SearchInvestors,
    SearchCompanies,
    Mentor,
    AskClarifyingQuestions,
    RejectSpam,
    CreateOrUpdateProject,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SearchInvestors => "search_investors",
            ActionKind::SearchCompanies => "search_companies",
            ActionKind::Mentor => "mentor",
            ActionKind::AskClarifyingQuestions => "ask_clarifying_questions",
            ActionKind::RejectSpam => "reject_spam",
            ActionKind::CreateOrUpdateProject => "create_or_update_project",
        }
    }

    /// Accepts canonical labels plus the aliases older prompts produced.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "search_investors" => Some(ActionKind::SearchInvestors),
            "search_companies" => Some(ActionKind::SearchCompanies),
            "mentor" | "mentoring" | "provide_advice" => Some(ActionKind::Mentor),
            "ask_clarifying_questions" | "ask_questions" => Some(ActionKind::AskClarifyingQuestions),
            "reject_spam" | "anti_spam" => Some(ActionKind::RejectSpam),
            "create_or_update_project" | "update_project" => Some(ActionKind::CreateOrUpdateProject),
            _ => None,
        }
    }

    pub fn all() -> [Self; 6] {
        [
            ActionKind::SearchInvestors,
            ActionKind::SearchCompanies,
            ActionKind::Mentor,
            ActionKind::AskClarifyingQuestions,
            ActionKind::RejectSpam,
            ActionKind::CreateOrUpdateProject,
        ]
    }

    pub fn is_search(&self) -> bool {
        matches!(self, ActionKind::SearchInvestors | ActionKind::SearchCompanies)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InvestorQuery {
    pub categories: Vec<String>,
    pub stage: Option<Stage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CompanyQuery {
    /// What the founder needs help with, in their words.
    pub problem_context: String,
    pub categories: Vec<String>,
}

/// An action together with its strongly-typed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum Action {
    SearchInvestors(InvestorQuery),
    SearchCompanies(CompanyQuery),
    Mentor { topic: String },
    AskClarifyingQuestions { questions: Vec<String> },
    RejectSpam,
    CreateOrUpdateProject,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::SearchInvestors(_) => ActionKind::SearchInvestors,
            Action::SearchCompanies(_) => ActionKind::SearchCompanies,
            Action::Mentor { .. } => ActionKind::Mentor,
            Action::AskClarifyingQuestions { .. } => ActionKind::AskClarifyingQuestions,
            Action::RejectSpam => ActionKind::RejectSpam,
            Action::CreateOrUpdateProject => ActionKind::CreateOrUpdateProject,
        }
    }

    pub fn clarify(questions: Vec<String>) -> Self {
        Action::AskClarifyingQuestions { questions }
    }
}

/// A proposed profile fact with the proposer's confidence (0-100).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactCandidate {
    pub value: FactValue,
    pub confidence: u8,
}

/// Candidate facts keyed by profile field.
pub type FactCandidates = BTreeMap<FactKey, FactCandidate>;

/// Combines two candidate sets, keeping the higher-confidence proposal per key.
pub fn merge_candidates(mut base: FactCandidates, extra: FactCandidates) -> FactCandidates {
    for (key, candidate) in extra {
        match base.get(&key) {
            Some(existing) if existing.confidence >= candidate.confidence => {}
            _ => {
                base.insert(key, candidate);
            }
        }
    }
    base
}

/// Output of the judge for one message. Transient: lives for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    /// 0-100.
    pub confidence: u8,
    pub facts: FactCandidates,
    pub spam: bool,
    #[serde(default)]
    pub reasoning: String,
    /// Set when the policy replaced the classifier's choice (e.g. gated search).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_intent: Option<ActionKind>,
    /// True when the classifier failed and this decision is the fail-closed default.
    #[serde(default)]
    pub fallback: bool,
}

impl Decision {
    /// Fail-closed decision used when classification errors or times out.
    pub fn fail_closed(questions: Vec<String>) -> Self {
        Self {
            action: Action::clarify(questions),
            confidence: 0,
            facts: FactCandidates::new(),
            spam: false,
            reasoning: "classifier unavailable".to_string(),
            original_intent: None,
            fallback: true,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.action.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_legacy_aliases() {
        assert_eq!(ActionKind::parse("mentoring"), Some(ActionKind::Mentor));
        assert_eq!(ActionKind::parse("ask_questions"), Some(ActionKind::AskClarifyingQuestions));
        assert_eq!(ActionKind::parse("anti_spam"), Some(ActionKind::RejectSpam));
        assert_eq!(ActionKind::parse("dance"), None);
    }

    #[test]
    fn merge_candidates_keeps_higher_confidence() {
        let mut a = FactCandidates::new();
        a.insert(FactKey::Stage, FactCandidate { value: FactValue::Stage(Stage::Mvp), confidence: 60 });
        let mut b = FactCandidates::new();
        b.insert(FactKey::Stage, FactCandidate { value: FactValue::Stage(Stage::Seed), confidence: 90 });
        b.insert(FactKey::Problem, FactCandidate { value: FactValue::Text("x".into()), confidence: 10 });
        let merged = merge_candidates(a, b);
        assert_eq!(merged[&FactKey::Stage].value, FactValue::Stage(Stage::Seed));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn action_serializes_tagged() {
        let json = serde_json::to_value(Action::Mentor { topic: "pricing".into() }).unwrap();
        assert_eq!(json["action"], "mentor");
        assert_eq!(json["payload"]["topic"], "pricing");
    }
}
