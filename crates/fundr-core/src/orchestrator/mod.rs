//! Per-message pipeline: gate, classify, meter, act, upsell, reply; reconciliation
//! is queued for the background worker.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::collaborators::{render_prompt, LanguageModel, ModelTask, ProgressChannel, ProgressEvent, ProgressPhase};
use crate::credit::CreditMeter;
use crate::decision::{Action, ActionKind, Decision};
use crate::error::{CreditError, EngineError, EngineResult, SkillError};
use crate::gate::{Gate, Language, Screening};
use crate::judge::Judge;
use crate::reconciler::{ReconcileJob, ReconcilerHandle};
use crate::shared::{Clock, CoreConfig, Plan, TurnContext};
use crate::store::{ConversationTurn, ProfileStore, Role, SledStore, StoredProfile, TurnMeta, TurnStore};
use crate::upsell::{ActionOutcome, UpsellAdvisor, UpsellSuggestion};
use crate::welcome::{self, Welcome, WelcomeKind};

/// Everything a skill needs to act on one decision.
#[derive(Debug, Clone)]
pub struct SkillRequest {
    pub action: Action,
    pub profile: StoredProfile,
    pub language: Language,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillOutput {
    pub reply: String,
    /// Cost to commit. `None` charges the full reserved amount.
    #[serde(default)]
    pub actual_cost: Option<u64>,
    /// Structured payload returned to the client (e.g. search candidates).
    #[serde(default)]
    pub data: serde_json::Value,
}

impl SkillOutput {
    pub fn text(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            ..Self::default()
        }
    }
}

/// Trait implemented by every action the judge can choose.
#[async_trait::async_trait]
pub trait ActionSkill: Send + Sync {
    /// Action this skill executes.
    fn kind(&self) -> ActionKind;

    async fn execute(&self, ctx: &TurnContext, request: &SkillRequest) -> Result<SkillOutput, SkillError>;
}

/// Registry of action skills, dispatched by [`ActionKind`].
pub struct SkillRegistry {
    skills: Vec<Arc<dyn ActionSkill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self { skills: Vec::new() }
    }

    /// Registers a skill; a later registration for the same kind replaces the earlier one.
    pub fn register(&mut self, skill: Arc<dyn ActionSkill>) {
        self.skills.retain(|s| s.kind() != skill.kind());
        self.skills.push(skill);
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn ActionSkill>> {
        self.skills.iter().find(|s| s.kind() == kind).cloned()
    }

    /// Labels of all registered skills (status endpoint).
    pub fn skill_names(&self) -> Vec<String> {
        self.skills.iter().map(|s| s.kind().as_str().to_string()).collect()
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    InputRejected,
    ClassificationFailed,
    InsufficientCredit,
    ActionFailed,
}

/// Result of one message, ready to be returned to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub reply: String,
    pub status: TurnStatus,
    pub action: Option<ActionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_intent: Option<ActionKind>,
    pub confidence: u8,
    pub spam_score: u8,
    pub language: Language,
    pub completeness: u8,
    pub credits_charged: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upsell: Option<UpsellSuggestion>,
    #[serde(default)]
    pub data: serde_json::Value,
}

fn insufficient_credit_reply(language: Language) -> &'static str {
    match language.reply_language() {
        Language::Spanish => {
            "Has alcanzado tu límite de créditos para esta acción. Vuelve mañana o mejora tu plan para seguir."
        }
        _ => "You've reached your credit limit for this action. Come back tomorrow or upgrade your plan to continue.",
    }
}

fn action_failed_reply(language: Language) -> &'static str {
    match language.reply_language() {
        Language::Spanish => {
            "Lo siento, no he podido completar esa acción ahora mismo. No se te ha cobrado nada; inténtalo de nuevo en unos minutos."
        }
        _ => "Sorry, I couldn't complete that right now. You haven't been charged; please try again in a few minutes.",
    }
}

fn progress_text(kind: ActionKind, language: Language) -> (ProgressPhase, &'static str) {
    let es = language.reply_language() == Language::Spanish;
    match (kind, es) {
        (ActionKind::SearchInvestors, true) => (ProgressPhase::Searching, "Buscando inversores para tu proyecto..."),
        (ActionKind::SearchInvestors, false) => (ProgressPhase::Searching, "Searching investors for your project..."),
        (ActionKind::SearchCompanies, true) => (ProgressPhase::Searching, "Buscando empresas que te puedan ayudar..."),
        (ActionKind::SearchCompanies, false) => (ProgressPhase::Searching, "Searching companies that can help..."),
        (_, true) => (ProgressPhase::Generating, "Preparando tu respuesta..."),
        (_, false) => (ProgressPhase::Generating, "Preparing your answer..."),
    }
}

/// Composes gate, judge, meter, skills, and upsell advisor into the per-message flow.
pub struct Orchestrator {
    store: Arc<SledStore>,
    registry: Arc<SkillRegistry>,
    model: Arc<dyn LanguageModel>,
    gate: Gate,
    judge: Judge,
    meter: Arc<CreditMeter>,
    upsell: UpsellAdvisor,
    reconciler: ReconcilerHandle,
    progress: Arc<dyn ProgressChannel>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        config: &CoreConfig,
        store: Arc<SledStore>,
        model: Arc<dyn LanguageModel>,
        registry: Arc<SkillRegistry>,
        progress: Arc<dyn ProgressChannel>,
        clock: Arc<dyn Clock>,
        reconciler: ReconcilerHandle,
    ) -> Self {
        Self {
            gate: Gate::new(model.clone(), config.gate.clone()),
            judge: Judge::new(model.clone(), config.judge.clone()),
            meter: Arc::new(CreditMeter::new(store.clone(), config.credit.clone(), clock.clone())),
            upsell: UpsellAdvisor::new(store.clone(), config.upsell.clone(), clock.clone()),
            store,
            registry,
            model,
            reconciler,
            progress,
            clock,
        }
    }

    pub fn meter(&self) -> Arc<CreditMeter> {
        self.meter.clone()
    }

    pub fn upsell(&self) -> &UpsellAdvisor {
        &self.upsell
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    /// Greeting for a user opening a project. Reads only; nothing is persisted or charged.
    pub fn welcome(&self, ctx: &TurnContext, language: Language) -> EngineResult<Welcome> {
        let profile = self.store.read(&ctx.project_id)?;
        let first_time = self.store.user_turn_count(&ctx.user_id)? == 0;
        let project_has_turns = !self.store.recent_turns(&ctx.project_id, 1)?.is_empty();
        let kind = WelcomeKind::classify(
            first_time,
            project_has_turns,
            profile.completeness.total,
            self.judge.config().min_completeness_for_search,
        );
        tracing::info!(
            target: "fundr::orchestrator",
            user_id = %ctx.user_id,
            project_id = %ctx.project_id,
            kind = ?kind,
            completeness = profile.completeness.total,
            "welcome composed"
        );
        Ok(welcome::compose(kind, &profile, language))
    }

    fn emit(&self, ctx: &TurnContext, phase: ProgressPhase, message: &str) {
        let mut event = ProgressEvent::new(phase, message);
        event.correlation_id = ctx.correlation_id.clone();
        self.progress.emit(&ctx.user_id, event);
    }

    fn persist_turns(
        &self,
        ctx: &TurnContext,
        text: &str,
        reply: &str,
        meta: TurnMeta,
        credits_charged: u64,
        received_ms: i64,
    ) -> EngineResult<()> {
        let user_turn = ConversationTurn {
            user_id: ctx.user_id.clone(),
            project_id: ctx.project_id.clone(),
            role: Role::User,
            text: text.to_string(),
            timestamp_ms: received_ms,
            meta: meta.clone(),
            credits_charged: 0,
        };
        let assistant_turn = ConversationTurn {
            role: Role::Assistant,
            text: reply.to_string(),
            timestamp_ms: self.clock.now_ms(),
            credits_charged,
            ..user_turn.clone()
        };
        self.store.append_turn(&user_turn)?;
        self.store.append_turn(&assistant_turn)?;
        Ok(())
    }

    async fn deflect(&self, text: &str, language: Language) -> String {
        let prompt = render_prompt(
            ModelTask::Deflect,
            &format!(
                "The message below is off-topic or abusive. Politely steer the user back to their startup \
                 and fundraising in two sentences at most.\n{}",
                language.instructions()
            ),
            &[("message", text)],
        );
        let timeout = Duration::from_millis(self.judge.config().model_timeout_ms);
        match tokio::time::timeout(timeout, self.model.generate(&prompt)).await {
            Ok(Ok(reply)) if !reply.trim().is_empty() => reply.trim().to_string(),
            _ => language.deflection().to_string(),
        }
    }

    async fn reject(
        &self,
        ctx: &TurnContext,
        text: &str,
        screening: &Screening,
        stored: &StoredProfile,
        received_ms: i64,
    ) -> EngineResult<TurnOutcome> {
        let err = EngineError::InputRejected {
            spam_score: screening.spam_score,
        };
        tracing::info!(
            target: "fundr::orchestrator",
            user_id = %ctx.user_id,
            project_id = %ctx.project_id,
            spam_score = screening.spam_score,
            "{}",
            err
        );
        let language = screening.language.reply_language();
        let reply = self.deflect(text, language).await;
        let meta = TurnMeta {
            action: Some(ActionKind::RejectSpam),
            spam: true,
            spam_score: screening.spam_score,
            language: Some(screening.language.as_str().to_string()),
            completeness: stored.completeness.total,
            ..TurnMeta::default()
        };
        self.persist_turns(ctx, text, &reply, meta, 0, received_ms)?;
        self.emit(ctx, ProgressPhase::Done, "");
        Ok(TurnOutcome {
            reply,
            status: TurnStatus::InputRejected,
            action: Some(ActionKind::RejectSpam),
            original_intent: None,
            confidence: 100,
            spam_score: screening.spam_score,
            language,
            completeness: stored.completeness.total,
            credits_charged: 0,
            upsell: None,
            data: serde_json::Value::Null,
        })
    }

    fn consider_upsell(&self, ctx: &TurnContext, plan: Plan, completeness: u8, outcome: ActionOutcome) -> Option<UpsellSuggestion> {
        let turn_index = match self.store.user_turn_count(&ctx.user_id) {
            Ok(count) => count + 1,
            Err(e) => {
                tracing::warn!(target: "fundr::orchestrator", error = %e, "upsell skipped, turn count unavailable");
                return None;
            }
        };
        match self.upsell.consider(&ctx.user_id, plan, completeness, outcome, turn_index) {
            Ok(suggestion) => suggestion,
            Err(e) => {
                tracing::warn!(target: "fundr::orchestrator", error = %e, "upsell skipped");
                None
            }
        }
    }

    fn enqueue_reconcile(&self, ctx: &TurnContext, decision: &Decision, stored: &StoredProfile, text: &str, language: Language) {
        self.reconciler.enqueue(ReconcileJob {
            project_id: ctx.project_id.clone(),
            facts: decision.facts.clone(),
            revision_seen: stored.revision,
            message: Some(text.to_string()),
            language,
        });
    }

    /// Handles one user message end to end. Only persistence failures are returned
    /// as errors; every other failure becomes a [`TurnStatus`] with a safe reply.
    pub async fn handle_message(&self, ctx: &TurnContext, text: &str) -> EngineResult<TurnOutcome> {
        let received_ms = self.clock.now_ms();
        self.emit(ctx, ProgressPhase::Screening, "");

        let stored = self.store.read(&ctx.project_id)?;
        let window_ms = self.gate.config().repetition_window_secs as i64 * 1_000;
        let recent_user = self.store.user_turns_since(&ctx.user_id, received_ms - window_ms)?;
        let screening = self.gate.screen(text, &recent_user).await;
        if screening.is_spam {
            return self.reject(ctx, text, &screening, &stored, received_ms).await;
        }
        let language = screening.language.reply_language();

        self.emit(ctx, ProgressPhase::Classifying, "");
        let history = self
            .store
            .recent_turns(&ctx.project_id, self.judge.config().history_window)?;
        let decision = self.judge.decide(text, &history, &stored, screening.language).await;
        if decision.kind() == ActionKind::RejectSpam {
            return self.reject(ctx, text, &screening, &stored, received_ms).await;
        }
        let decision = self.judge.gate_search(decision, &stored, language);
        let kind = decision.kind();

        let mut status = if decision.fallback {
            TurnStatus::ClassificationFailed
        } else {
            TurnStatus::Completed
        };
        let meta = TurnMeta {
            action: Some(kind),
            confidence: decision.confidence,
            original_intent: decision.original_intent,
            spam: false,
            spam_score: screening.spam_score,
            language: Some(screening.language.as_str().to_string()),
            completeness: stored.completeness.total,
        };

        let account = self.meter.open_account(&ctx.user_id, ctx.plan)?;
        let plan = account.plan;
        let cost = self.meter.cost_of(plan, kind);

        let mut reservation_id = None;
        if cost > 0 {
            let reserve = self.meter.reserve(&ctx.user_id, kind)?;
            if !reserve.allowed {
                let err: EngineError = CreditError::Denied {
                    action: kind.as_str().to_string(),
                    needed: reserve.cost,
                    available: reserve.available,
                }
                .into();
                tracing::info!(target: "fundr::orchestrator", user_id = %ctx.user_id, action = %kind, "{}", err);
                let upsell =
                    self.consider_upsell(ctx, plan, stored.completeness.total, ActionOutcome::Blocked(kind));
                let mut reply = insufficient_credit_reply(language).to_string();
                if let Some(s) = &upsell {
                    reply = format!("{}\n\n{}", reply, s.message(language));
                }
                self.persist_turns(ctx, text, &reply, meta, 0, received_ms)?;
                self.enqueue_reconcile(ctx, &decision, &stored, text, language);
                self.emit(ctx, ProgressPhase::Done, "");
                return Ok(TurnOutcome {
                    reply,
                    status: TurnStatus::InsufficientCredit,
                    action: Some(kind),
                    original_intent: decision.original_intent,
                    confidence: decision.confidence,
                    spam_score: screening.spam_score,
                    language,
                    completeness: stored.completeness.total,
                    credits_charged: 0,
                    upsell,
                    data: serde_json::Value::Null,
                });
            }
            reservation_id = reserve.reservation_id;
        }

        let (phase, progress) = progress_text(kind, language);
        self.emit(ctx, phase, progress);

        let request = SkillRequest {
            action: decision.action.clone(),
            profile: stored.clone(),
            language,
            message: text.to_string(),
        };
        let result = match self.registry.get(kind) {
            Some(skill) => skill.execute(ctx, &request).await,
            None => Err(SkillError::UnknownAction(kind.as_str().to_string())),
        };

        let (reply, credits_charged, data, upsell) = match result {
            Ok(output) => {
                let charged = match reservation_id.as_deref() {
                    Some(id) => match self.meter.commit(id, output.actual_cost.unwrap_or(cost)) {
                        Ok(charged) => charged,
                        Err(CreditError::UnknownReservation(_)) => 0,
                        Err(e) => return Err(e.into()),
                    },
                    None => 0,
                };
                let outcome = match decision.original_intent {
                    Some(original) => ActionOutcome::Downgraded(original),
                    None => ActionOutcome::Executed(kind),
                };
                let upsell = self.consider_upsell(ctx, plan, stored.completeness.total, outcome);
                let mut reply = output.reply;
                if let Some(s) = &upsell {
                    reply = format!("{}\n\n{}", reply, s.message(language));
                }
                (reply, charged, output.data, upsell)
            }
            Err(skill_err) => {
                if let Some(id) = reservation_id.as_deref() {
                    if let Err(e) = self.meter.release(id) {
                        tracing::warn!(target: "fundr::orchestrator", reservation_id = %id, error = %e, "release failed");
                    }
                }
                let err = EngineError::ActionFailed(skill_err);
                tracing::warn!(
                    target: "fundr::orchestrator",
                    user_id = %ctx.user_id,
                    project_id = %ctx.project_id,
                    action = %kind,
                    "{}",
                    err
                );
                status = TurnStatus::ActionFailed;
                self.emit(ctx, ProgressPhase::Failed, "");
                (action_failed_reply(language).to_string(), 0, serde_json::Value::Null, None)
            }
        };

        self.persist_turns(ctx, text, &reply, meta, credits_charged, received_ms)?;
        self.enqueue_reconcile(ctx, &decision, &stored, text, language);
        self.emit(ctx, ProgressPhase::Done, "");

        tracing::info!(
            target: "fundr::orchestrator",
            user_id = %ctx.user_id,
            project_id = %ctx.project_id,
            action = %kind,
            status = ?status,
            credits_charged,
            "turn handled"
        );

        Ok(TurnOutcome {
            reply,
            status,
            action: Some(kind),
            original_intent: decision.original_intent,
            confidence: decision.confidence,
            spam_score: screening.spam_score,
            language,
            completeness: stored.completeness.total,
            credits_charged,
            upsell,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(ActionKind, &'static str);

    #[async_trait::async_trait]
    impl ActionSkill for Echo {
        fn kind(&self) -> ActionKind {
            self.0
        }
        async fn execute(&self, _ctx: &TurnContext, _request: &SkillRequest) -> Result<SkillOutput, SkillError> {
            Ok(SkillOutput::text(self.1))
        }
    }

    #[test]
    fn registry_dispatches_by_kind_and_replaces() {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(Echo(ActionKind::Mentor, "a")));
        registry.register(Arc::new(Echo(ActionKind::AskClarifyingQuestions, "b")));
        registry.register(Arc::new(Echo(ActionKind::Mentor, "c")));
        assert_eq!(registry.skill_names().len(), 2);
        assert!(registry.get(ActionKind::SearchInvestors).is_none());
        assert_eq!(registry.get(ActionKind::Mentor).map(|s| s.kind()), Some(ActionKind::Mentor));
    }

    #[test]
    fn localized_replies() {
        assert!(insufficient_credit_reply(Language::Spanish).contains("créditos"));
        assert!(action_failed_reply(Language::Other).contains("haven't been charged"));
        assert_eq!(progress_text(ActionKind::SearchCompanies, Language::English).0, ProgressPhase::Searching);
    }
}
