//! Upsell advisor: a fixed decision table plus anti-saturation checks against
//! the persisted upsell history.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::decision::ActionKind;
use crate::error::StoreError;
use crate::gate::Language;
use crate::shared::{Clock, Plan, UpsellConfig};
use crate::store::{UpsellRecord, UpsellStore};

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;

/// What happened to the action this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Executed(ActionKind),
    /// Denied by the credit meter.
    Blocked(ActionKind),
    /// Search downgraded to clarification by the completeness gate.
    Downgraded(ActionKind),
    /// Rejected, failed, or otherwise nothing to sell against.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsellSuggestion {
    pub target_plan: Plan,
    pub trigger: String,
    pub confidence: u8,
}

impl UpsellSuggestion {
    /// Localized text appended to the reply.
    pub fn message(&self, language: Language) -> String {
        let es = language.reply_language() == Language::Spanish;
        match (self.target_plan, es) {
            (Plan::Pro, true) => "Con el plan Pro tendrás más búsquedas diarias a menor coste. ¿Quieres probarlo?".into(),
            (Plan::Pro, false) => "The Pro plan gives you more daily searches at a lower cost. Want to try it?".into(),
            (Plan::Outreach, true) => {
                "Con el plan Outreach podemos contactar por ti a los inversores que encajan con tu proyecto.".into()
            }
            (Plan::Outreach, false) => {
                "With the Outreach plan we can reach out to matching investors on your behalf.".into()
            }
            (Plan::Free, _) => String::new(),
        }
    }
}

/// Per-user summary of shown upsells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsellAnalytics {
    pub total: usize,
    pub last_30_days: usize,
    pub most_common_trigger: Option<String>,
    pub average_confidence: f64,
}

/// The decision table. Returns (target plan, trigger, confidence).
pub fn table_lookup(plan: Plan, outcome: ActionOutcome, completeness: u8) -> Option<(Plan, &'static str, u8)> {
    use ActionKind::*;
    use ActionOutcome::*;
    match (plan, outcome) {
        (Plan::Free, Blocked(kind)) if kind.is_search() || kind == Mentor => Some((Plan::Pro, "search_limit_reached", 90)),
        (Plan::Free, Executed(kind)) if kind.is_search() && completeness >= 80 => Some((Plan::Pro, "power_user", 75)),
        (Plan::Free, Executed(Mentor)) if completeness >= 80 => Some((Plan::Outreach, "high_engagement", 82)),
        (Plan::Pro, Executed(SearchInvestors)) if completeness >= 50 => Some((Plan::Outreach, "outreach_interest", 85)),
        _ => None,
    }
}

pub struct UpsellAdvisor {
    store: Arc<dyn UpsellStore>,
    config: UpsellConfig,
    clock: Arc<dyn Clock>,
}

impl UpsellAdvisor {
    pub fn new(store: Arc<dyn UpsellStore>, config: UpsellConfig, clock: Arc<dyn Clock>) -> Self {
        Self { store, config, clock }
    }

    /// Why the last suggestion still suppresses a new one, if it does.
    fn suppression(&self, history: &[UpsellRecord], turn_index: u64, now: i64) -> Option<&'static str> {
        if let Some(last) = history.iter().max_by_key(|r| (r.timestamp_ms, r.turn_index)) {
            let turns_since = turn_index.saturating_sub(last.turn_index);
            if turns_since < self.config.cooldown_turns as u64 {
                return Some("cooldown_turns");
            }
            if now - last.timestamp_ms < self.config.cooldown_hours as i64 * HOUR_MS {
                return Some("cooldown_hours");
            }
        }
        let today = history.iter().filter(|r| now - r.timestamp_ms < DAY_MS).count();
        if today >= self.config.daily_cap as usize {
            return Some("daily_cap");
        }
        None
    }

    /// Returns a suggestion and records it, or `None` when the table has nothing,
    /// confidence is too low, or the user is inside the cooldown or over the cap.
    /// `turn_index` is the user's turn number for the current message.
    pub fn consider(
        &self,
        user_id: &str,
        plan: Plan,
        completeness: u8,
        outcome: ActionOutcome,
        turn_index: u64,
    ) -> Result<Option<UpsellSuggestion>, StoreError> {
        if !self.config.enabled {
            return Ok(None);
        }
        let Some((target_plan, trigger, confidence)) = table_lookup(plan, outcome, completeness) else {
            return Ok(None);
        };
        if confidence <= self.config.min_confidence {
            tracing::debug!(target: "fundr::upsell", user_id = %user_id, trigger, confidence, "below confidence threshold");
            return Ok(None);
        }

        let now = self.clock.now_ms();
        let history = self.store.upsells_for(user_id)?;
        if let Some(reason) = self.suppression(&history, turn_index, now) {
            tracing::debug!(target: "fundr::upsell", user_id = %user_id, trigger, reason, "upsell suppressed");
            return Ok(None);
        }

        self.store.record_upsell(&UpsellRecord {
            user_id: user_id.to_string(),
            target_plan,
            trigger: trigger.to_string(),
            confidence,
            turn_index,
            timestamp_ms: now,
        })?;
        tracing::info!(
            target: "fundr::upsell",
            user_id = %user_id,
            target_plan = target_plan.as_str(),
            trigger,
            confidence,
            "upsell suggested"
        );
        Ok(Some(UpsellSuggestion {
            target_plan,
            trigger: trigger.to_string(),
            confidence,
        }))
    }

    pub fn analytics(&self, user_id: &str) -> Result<UpsellAnalytics, StoreError> {
        let history = self.store.upsells_for(user_id)?;
        let now = self.clock.now_ms();
        let mut by_trigger: HashMap<&str, usize> = HashMap::new();
        for r in &history {
            *by_trigger.entry(r.trigger.as_str()).or_default() += 1;
        }
        let most_common_trigger = by_trigger
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(t, _)| t.to_string());
        let average_confidence = if history.is_empty() {
            0.0
        } else {
            history.iter().map(|r| r.confidence as f64).sum::<f64>() / history.len() as f64
        };
        Ok(UpsellAnalytics {
            total: history.len(),
            last_30_days: history.iter().filter(|r| now - r.timestamp_ms < 30 * DAY_MS).count(),
            most_common_trigger,
            average_confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ManualClock;
    use crate::store::SledStore;

    fn advisor() -> (UpsellAdvisor, Arc<ManualClock>) {
        let store = Arc::new(SledStore::temporary().unwrap());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        (UpsellAdvisor::new(store, UpsellConfig::default(), clock.clone()), clock)
    }

    const BLOCKED: ActionOutcome = ActionOutcome::Blocked(ActionKind::SearchInvestors);

    #[test]
    fn table_matches_documented_rows() {
        assert_eq!(table_lookup(Plan::Free, BLOCKED, 10), Some((Plan::Pro, "search_limit_reached", 90)));
        assert_eq!(
            table_lookup(Plan::Pro, ActionOutcome::Executed(ActionKind::SearchInvestors), 50),
            Some((Plan::Outreach, "outreach_interest", 85))
        );
        assert_eq!(
            table_lookup(Plan::Free, ActionOutcome::Downgraded(ActionKind::SearchInvestors), 10),
            None
        );
        assert_eq!(table_lookup(Plan::Outreach, BLOCKED, 90), None);
    }

    #[test]
    fn low_confidence_rows_never_fire() {
        let (advisor, _) = advisor();
        let out = advisor
            .consider("u1", Plan::Free, 90, ActionOutcome::Executed(ActionKind::SearchCompanies), 1)
            .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn cooldown_blocks_next_turn_even_if_triggered() {
        let (advisor, clock) = advisor();
        assert!(advisor.consider("u1", Plan::Free, 10, BLOCKED, 3).unwrap().is_some());
        clock.advance_ms(60_000);
        assert!(advisor.consider("u1", Plan::Free, 10, BLOCKED, 4).unwrap().is_none());
    }

    #[test]
    fn both_turns_and_hours_must_elapse() {
        let (advisor, clock) = advisor();
        assert!(advisor.consider("u1", Plan::Free, 10, BLOCKED, 1).unwrap().is_some());
        // Enough turns, not enough time.
        clock.advance_hours(1);
        assert!(advisor.consider("u1", Plan::Free, 10, BLOCKED, 10).unwrap().is_none());
        // Enough time, not enough turns.
        let (advisor, clock) = self::advisor();
        assert!(advisor.consider("u1", Plan::Free, 10, BLOCKED, 1).unwrap().is_some());
        clock.advance_hours(5);
        assert!(advisor.consider("u1", Plan::Free, 10, BLOCKED, 2).unwrap().is_none());
        assert!(advisor.consider("u1", Plan::Free, 10, BLOCKED, 4).unwrap().is_some());
    }

    #[test]
    fn daily_cap_counts_rolling_day() {
        let (advisor, clock) = advisor();
        let cfg = UpsellConfig {
            cooldown_hours: 0,
            cooldown_turns: 0,
            daily_cap: 2,
            ..UpsellConfig::default()
        };
        let advisor = UpsellAdvisor::new(advisor.store.clone(), cfg, clock.clone());
        assert!(advisor.consider("u1", Plan::Free, 10, BLOCKED, 1).unwrap().is_some());
        assert!(advisor.consider("u1", Plan::Free, 10, BLOCKED, 2).unwrap().is_some());
        assert!(advisor.consider("u1", Plan::Free, 10, BLOCKED, 3).unwrap().is_none());
        clock.advance_hours(24);
        assert!(advisor.consider("u1", Plan::Free, 10, BLOCKED, 4).unwrap().is_some());
    }

    #[test]
    fn analytics_summarizes_history() {
        let (advisor, clock) = advisor();
        advisor.consider("u1", Plan::Free, 10, BLOCKED, 1).unwrap();
        clock.advance_hours(5);
        advisor
            .consider("u1", Plan::Pro, 60, ActionOutcome::Executed(ActionKind::SearchInvestors), 5)
            .unwrap();
        clock.advance_hours(5);
        advisor.consider("u1", Plan::Free, 10, BLOCKED, 9).unwrap();
        let a = advisor.analytics("u1").unwrap();
        assert_eq!(a.total, 3);
        assert_eq!(a.last_30_days, 3);
        assert_eq!(a.most_common_trigger.as_deref(), Some("search_limit_reached"));
        assert!((a.average_confidence - (90.0 + 85.0 + 90.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn suggestion_message_is_localized() {
        let s = UpsellSuggestion {
            target_plan: Plan::Pro,
            trigger: "search_limit_reached".into(),
            confidence: 90,
        };
        assert!(s.message(Language::Spanish).contains("plan Pro"));
        assert!(s.message(Language::Other).contains("Pro plan"));
    }
}
