//! fundr-core: conversation decision engine for the fundraising assistant.
//!
//! Gate, judge, credit meter, upsell advisor, profile reconciler and the
//! orchestrator that composes them, plus the project welcome, on top of a
//! sled-backed store. Model and search backends are injected through the
//! traits in [`collaborators`].

pub mod collaborators;
pub mod credit;
pub mod decision;
pub mod error;
pub mod gate;
pub mod judge;
pub mod orchestrator;
pub mod profile;
pub mod reconciler;
pub mod shared;
pub mod store;
pub mod upsell;
pub mod welcome;

pub use collaborators::{
    prompt_section, prompt_task, render_prompt, BroadcastProgress, LanguageModel, ModelTask, NoopProgress,
    ProgressChannel, ProgressEvent, ProgressPhase, SearchCandidate, SearchIndex, SearchKind, SearchQuery,
};
pub use credit::{CreditMeter, CreditSnapshot, ReserveOutcome};
pub use decision::{Action, ActionKind, CompanyQuery, Decision, FactCandidate, FactCandidates, InvestorQuery};
pub use error::{CreditError, EngineError, EngineResult, ModelError, SearchError, SkillError, StoreError};
pub use gate::{Gate, Language, Screening};
pub use judge::Judge;
pub use orchestrator::{ActionSkill, Orchestrator, SkillOutput, SkillRegistry, SkillRequest, TurnOutcome, TurnStatus};
pub use profile::{CompletenessReport, FactKey, FactValue, MergeMode, ProfileField, ProjectProfile, Stage};
pub use reconciler::{ReconcileJob, ReconcileOutcome, Reconciler, ReconcilerHandle};
pub use shared::{Clock, CoreConfig, ManualClock, Plan, SystemClock, TurnContext};
pub use store::{ConversationTurn, Role, SledStore, StoredProfile, TurnMeta};
pub use upsell::{ActionOutcome, UpsellAdvisor, UpsellAnalytics, UpsellSuggestion};
pub use welcome::{Welcome, WelcomeKind};
