//! Chat endpoint and the per-user progress stream.

use axum::extract::{Json, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;

use fundr_core::{Plan, TurnContext, TurnOutcome};

use super::{require, ApiError};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct ChatRequest {
    user_id: String,
    project_id: String,
    message: String,
    /// Plan used when the user's credit account does not exist yet.
    #[serde(default)]
    plan: Option<Plan>,
    #[serde(default)]
    correlation_id: Option<String>,
}

/// POST /v1/chat – runs one message through the engine.
pub(crate) async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<TurnOutcome>, ApiError> {
    require("user_id", &req.user_id)?;
    require("project_id", &req.project_id)?;
    require("message", &req.message)?;

    let mut ctx = TurnContext::new(req.user_id, req.project_id, req.plan.unwrap_or_default());
    ctx.correlation_id = req.correlation_id;
    tracing::debug!(
        target: "fundr::gateway",
        user_id = %ctx.user_id,
        project_id = %ctx.project_id,
        chars = req.message.len(),
        "chat request"
    );
    let outcome = state.orchestrator.handle_message(&ctx, &req.message).await?;
    Ok(Json(outcome))
}

/// GET /v1/progress/:user_id – Server-Sent Events stream of the user's progress events.
pub(crate) async fn progress_stream(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let rx = state.progress.subscribe(&user_id);
    let stream = BroadcastStream::new(rx).filter_map(|item| {
        let event = item
            .ok()
            .and_then(|ev| Event::default().event("progress").json_data(&ev).ok())
            .map(Ok);
        std::future::ready(event)
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive"))
}
