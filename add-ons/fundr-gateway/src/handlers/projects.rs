//! Project profile endpoints: completeness, welcome, explicit edits, forced reconciliation.

use axum::extract::{Json, Path, Query, State};
use serde::{Deserialize, Serialize};

use fundr_core::judge::parse_facts;
use fundr_core::store::ProfileStore;
use fundr_core::{
    CompletenessReport, FactKey, FactValue, Language, Plan, ProjectProfile, ReconcileOutcome, TurnContext, Welcome,
};

use super::{require, ApiError};
use crate::AppState;

#[derive(Debug, Serialize)]
pub(crate) struct ProjectView {
    project_id: String,
    revision: u64,
    completeness: CompletenessReport,
    profile: ProjectProfile,
}

impl ProjectView {
    fn load(state: &AppState, project_id: String) -> Result<Self, ApiError> {
        let stored = state.store.read(&project_id)?;
        Ok(Self {
            project_id,
            revision: stored.revision,
            completeness: stored.completeness,
            profile: stored.profile,
        })
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct UpdateResponse {
    changed: bool,
    #[serde(flatten)]
    project: ProjectView,
}

impl UpdateResponse {
    fn new(state: &AppState, project_id: String, outcome: ReconcileOutcome) -> Result<Self, ApiError> {
        Ok(Self {
            changed: matches!(outcome, ReconcileOutcome::Applied { .. }),
            project: ProjectView::load(state, project_id)?,
        })
    }
}

/// GET /v1/projects/:project_id/completeness
pub(crate) async fn completeness(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectView>, ApiError> {
    require("project_id", &project_id)?;
    Ok(Json(ProjectView::load(&state, project_id)?))
}

#[derive(Debug, Deserialize)]
pub(crate) struct WelcomeQuery {
    user_id: String,
    #[serde(default)]
    language: Option<String>,
}

/// GET /v1/projects/:project_id/welcome?user_id=..&language=..
pub(crate) async fn welcome(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<WelcomeQuery>,
) -> Result<Json<Welcome>, ApiError> {
    require("project_id", &project_id)?;
    require("user_id", &query.user_id)?;
    let language = query.language.as_deref().map(Language::parse).unwrap_or_default();
    let ctx = TurnContext::new(query.user_id, project_id, Plan::default());
    Ok(Json(state.orchestrator.welcome(&ctx, language)?))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProfileEdit {
    facts: serde_json::Map<String, serde_json::Value>,
}

/// PATCH /v1/projects/:project_id/profile – facts set by the user; they override extracted ones.
pub(crate) async fn edit_profile(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(req): Json<ProfileEdit>,
) -> Result<Json<UpdateResponse>, ApiError> {
    require("project_id", &project_id)?;
    let edits: Vec<(FactKey, FactValue)> = parse_facts(&req.facts)
        .into_iter()
        .map(|(key, candidate)| (key, candidate.value))
        .collect();
    if edits.is_empty() {
        return Err(ApiError::bad_request("no recognised facts in request"));
    }
    let outcome = state.reconciler.apply_user_edit(&project_id, edits).await?;
    tracing::info!(target: "fundr::gateway", project_id = %project_id, outcome = ?outcome, "profile edited");
    Ok(Json(UpdateResponse::new(&state, project_id, outcome)?))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ReconcileRequest {
    #[serde(default)]
    language: Option<String>,
}

/// POST /v1/projects/:project_id/reconcile – re-extracts facts from recent history.
pub(crate) async fn reconcile(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    body: Option<Json<ReconcileRequest>>,
) -> Result<Json<UpdateResponse>, ApiError> {
    require("project_id", &project_id)?;
    let language = body
        .and_then(|Json(req)| req.language)
        .map(|l| Language::parse(&l))
        .unwrap_or_default();
    let outcome = state.reconciler.reconcile_history(&project_id, language).await?;
    Ok(Json(UpdateResponse::new(&state, project_id, outcome)?))
}
