//! Investor and company search skills: query the index, render the top results.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use fundr_core::{
    Action, ActionKind, ActionSkill, Language, SearchCandidate, SearchIndex, SearchKind, SearchQuery, SkillError,
    SkillOutput, SkillRequest, TurnContext,
};

/// Results shown per search.
const RESULT_LIMIT: usize = 3;

/// Completeness band in which results carry a "complete your profile" hint.
const HINT_BAND: std::ops::Range<u8> = 50..70;

fn header(kind: SearchKind, language: Language) -> &'static str {
    match (kind, language.reply_language()) {
        (SearchKind::Investors, Language::Spanish) => "Estos son los inversores que mejor encajan con tu proyecto:",
        (SearchKind::Investors, _) => "Here are the investors that best fit your project:",
        (SearchKind::Companies, Language::Spanish) => "Estas empresas te pueden ayudar:",
        (SearchKind::Companies, _) => "These companies can help you:",
    }
}

fn no_results(kind: SearchKind, language: Language) -> &'static str {
    match (kind, language.reply_language()) {
        (SearchKind::Investors, Language::Spanish) => {
            "Todavía no he encontrado inversores que encajen con tu perfil. No se te ha cobrado esta búsqueda; \
             prueba a ampliar tus categorías."
        }
        (SearchKind::Investors, _) => {
            "I couldn't find investors matching your profile yet. You haven't been charged for this search; \
             try broadening your categories."
        }
        (SearchKind::Companies, Language::Spanish) => {
            "No he encontrado empresas para esa necesidad. No se te ha cobrado esta búsqueda; \
             cuéntame un poco más sobre lo que buscas."
        }
        (SearchKind::Companies, _) => {
            "I couldn't find companies for that need. You haven't been charged for this search; \
             tell me a bit more about what you're looking for."
        }
    }
}

fn profile_hint(completeness: u8, language: Language) -> Option<String> {
    if !HINT_BAND.contains(&completeness) {
        return None;
    }
    Some(match language.reply_language() {
        Language::Spanish => format!(
            "Consejo: tu perfil está completo al {}%. Si añades métricas y datos del equipo, los resultados serán más precisos.",
            completeness
        ),
        _ => format!(
            "Tip: your profile is {}% complete. Adding metrics and team details will sharpen these matches.",
            completeness
        ),
    })
}

/// Renders ranked candidates as a short numbered list.
pub fn render_results(kind: SearchKind, candidates: &[SearchCandidate], completeness: u8, language: Language) -> String {
    let mut out = String::from(header(kind, language));
    out.push('\n');
    for (i, c) in candidates.iter().take(RESULT_LIMIT).enumerate() {
        out.push_str(&format!("\n{}. {}", i + 1, c.name));
        if !c.description.trim().is_empty() {
            out.push_str(&format!(": {}", c.description.trim()));
        }
        if let Some(url) = &c.url {
            out.push_str(&format!(" ({})", url));
        }
    }
    if let Some(hint) = profile_hint(completeness, language) {
        out.push_str("\n\n");
        out.push_str(&hint);
    }
    out
}

async fn run_search(
    index: &dyn SearchIndex,
    kind: SearchKind,
    query: SearchQuery,
    request: &SkillRequest,
) -> Result<SkillOutput, SkillError> {
    let candidates = index.query(kind, &query).await?;
    let completeness = request.profile.completeness.total;
    tracing::info!(
        target: "fundr::skills",
        kind = ?kind,
        results = candidates.len(),
        completeness,
        "search executed"
    );
    if candidates.is_empty() {
        return Ok(SkillOutput {
            reply: no_results(kind, request.language).to_string(),
            actual_cost: Some(0),
            data: json!({ "candidates": [] }),
        });
    }
    Ok(SkillOutput {
        reply: render_results(kind, &candidates, completeness, request.language),
        actual_cost: None,
        data: json!({ "candidates": candidates }),
    })
}

pub struct InvestorSearch {
    index: Arc<dyn SearchIndex>,
}

impl InvestorSearch {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl ActionSkill for InvestorSearch {
    fn kind(&self) -> ActionKind {
        ActionKind::SearchInvestors
    }

    async fn execute(&self, _ctx: &TurnContext, request: &SkillRequest) -> Result<SkillOutput, SkillError> {
        let Action::SearchInvestors(q) = &request.action else {
            return Err(SkillError::Other("investor search received a different action".into()));
        };
        let query = SearchQuery {
            categories: q.categories.clone(),
            stage: q.stage,
            problem_context: request.profile.profile.problem.clone(),
            limit: RESULT_LIMIT,
        };
        run_search(self.index.as_ref(), SearchKind::Investors, query, request).await
    }
}

pub struct CompanySearch {
    index: Arc<dyn SearchIndex>,
}

impl CompanySearch {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl ActionSkill for CompanySearch {
    fn kind(&self) -> ActionKind {
        ActionKind::SearchCompanies
    }

    async fn execute(&self, _ctx: &TurnContext, request: &SkillRequest) -> Result<SkillOutput, SkillError> {
        let Action::SearchCompanies(q) = &request.action else {
            return Err(SkillError::Other("company search received a different action".into()));
        };
        let query = SearchQuery {
            categories: q.categories.clone(),
            stage: request.profile.profile.stage,
            problem_context: Some(q.problem_context.clone()),
            limit: RESULT_LIMIT,
        };
        run_search(self.index.as_ref(), SearchKind::Companies, query, request).await
    }
}
