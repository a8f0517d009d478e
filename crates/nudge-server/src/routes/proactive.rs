use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use nudge_bus::HubStats;
use nudge_schema::RunState;
use serde::Deserialize;

use super::{events, internal_error, resolve_user, UserQuery};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ToggleBody {
    pub user_id: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserBody {
    pub user_id: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stream", get(events::proactive_stream))
        .route("/state", get(get_state).put(set_enabled))
        .route("/state/clear-cooldown", post(clear_cooldown))
        .route("/hub", get(hub_stats))
}

pub async fn get_state(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<RunState>, StatusCode> {
    let user_id = resolve_user(&state, query.user_id)?;
    state
        .states
        .load(&user_id)
        .await
        .map(Json)
        .map_err(|e| internal_error("failed to load run state", e))
}

pub async fn set_enabled(
    State(state): State<AppState>,
    Json(body): Json<ToggleBody>,
) -> Result<Json<RunState>, StatusCode> {
    let user_id = resolve_user(&state, body.user_id)?;
    let enabled = body.enabled;
    let updated = state
        .states
        .update(&user_id, |s| s.enabled = enabled)
        .await
        .map_err(|e| internal_error("failed to update run state", e))?;
    tracing::info!(user_id, enabled, "proactive engagement toggled");
    Ok(Json(updated))
}

pub async fn clear_cooldown(
    State(state): State<AppState>,
    Json(body): Json<UserBody>,
) -> Result<Json<RunState>, StatusCode> {
    let user_id = resolve_user(&state, body.user_id)?;
    let updated = state
        .states
        .update(&user_id, RunState::clear_cooldown)
        .await
        .map_err(|e| internal_error("failed to update run state", e))?;
    tracing::info!(user_id, "proactive cooldown cleared");
    Ok(Json(updated))
}

pub async fn hub_stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats())
}
