//! Credit account and upsell analytics endpoints.

use axum::extract::{Json, Path, State};
use serde::Deserialize;

use fundr_core::{CreditSnapshot, Plan, UpsellAnalytics};

use super::{require, ApiError};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct PlanRequest {
    plan: Plan,
}

/// POST /v1/credits/:user_id – creates the account or moves it to another plan.
pub(crate) async fn set_plan(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<PlanRequest>,
) -> Result<Json<CreditSnapshot>, ApiError> {
    require("user_id", &user_id)?;
    let meter = state.orchestrator.meter();
    meter.set_plan(&user_id, req.plan)?;
    let snapshot = meter
        .balance(&user_id)?
        .ok_or_else(|| ApiError::not_found(format!("no credit account for {}", user_id)))?;
    Ok(Json(snapshot))
}

/// GET /v1/credits/:user_id
pub(crate) async fn balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<CreditSnapshot>, ApiError> {
    state
        .orchestrator
        .meter()
        .balance(&user_id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no credit account for {}", user_id)))
}

/// GET /v1/upsell/:user_id/analytics
pub(crate) async fn upsell_analytics(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UpsellAnalytics>, ApiError> {
    Ok(Json(state.orchestrator.upsell().analytics(&user_id)?))
}
