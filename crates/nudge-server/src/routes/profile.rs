use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use nudge_memory::{ProfileError, ProfilePatch};
use serde::Deserialize;
use serde_json::Value;

use super::{internal_error, resolve_user, UserQuery};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PatchBody {
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub patch: ProfilePatch,
}

#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    pub user_id: Option<String>,
    pub path: String,
    #[serde(default = "default_revoke_reason")]
    pub reason: String,
}

fn default_revoke_reason() -> String {
    "user_revoke".to_string()
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_profile).patch(patch_profile))
        .route("/revoke", post(revoke_field))
}

pub fn schedule_router() -> Router<AppState> {
    Router::new().route("/", get(get_schedule))
}

fn profile_error_status(err: anyhow::Error) -> StatusCode {
    match err.downcast_ref::<ProfileError>() {
        Some(ProfileError::EmptyPath) => StatusCode::BAD_REQUEST,
        Some(ProfileError::FieldNotFound(_)) => StatusCode::NOT_FOUND,
        None => internal_error("profile update failed", err),
    }
}

pub async fn get_profile(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>, StatusCode> {
    let user_id = resolve_user(&state, query.user_id)?;
    state
        .profiles
        .load(&user_id)
        .await
        .map(Json)
        .map_err(|e| internal_error("failed to load profile", e))
}

pub async fn patch_profile(
    State(state): State<AppState>,
    Json(body): Json<PatchBody>,
) -> Result<Json<Value>, StatusCode> {
    let user_id = resolve_user(&state, body.user_id)?;
    let profile = state
        .profiles
        .patch(&user_id, &body.patch)
        .await
        .map_err(profile_error_status)?;
    tracing::info!(user_id, path = %body.patch.path, "profile field updated");
    state.hub.broadcast_profile(&user_id).await;
    Ok(Json(profile))
}

pub async fn revoke_field(
    State(state): State<AppState>,
    Json(body): Json<RevokeBody>,
) -> Result<Json<Value>, StatusCode> {
    let user_id = resolve_user(&state, body.user_id)?;
    let profile = state
        .profiles
        .revoke(&user_id, &body.path, &body.reason)
        .await
        .map_err(profile_error_status)?;
    tracing::info!(user_id, path = %body.path, "profile field revoked");
    state.hub.broadcast_profile(&user_id).await;
    Ok(Json(profile))
}

pub async fn get_schedule(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>, StatusCode> {
    let user_id = resolve_user(&state, query.user_id)?;
    match state.profiles.schedule(&user_id).await {
        Ok(Some(schedule)) => Ok(Json(schedule)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(internal_error("failed to load schedule", e)),
    }
}
