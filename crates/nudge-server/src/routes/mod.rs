pub mod chat;
pub mod events;
pub mod proactive;
pub mod profile;

use axum::http::StatusCode;
use axum::Router;
use nudge_memory::validate_user_id;
use serde::Deserialize;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/state", events::router())
        .nest("/chat", chat::router())
        .nest("/profile", profile::router())
        .nest("/schedule", profile::schedule_router())
        .nest("/proactive", proactive::router())
}

#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    pub user_id: Option<String>,
}

/// Falls back to the configured default user and rejects ids unusable as storage keys.
pub fn resolve_user(state: &AppState, user_id: Option<String>) -> Result<String, StatusCode> {
    let user_id = user_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| state.default_user_id.clone());
    validate_user_id(&user_id).map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok(user_id)
}

pub(crate) fn internal_error(context: &str, err: anyhow::Error) -> StatusCode {
    tracing::error!(error = %format!("{err:#}"), "{context}");
    StatusCode::INTERNAL_SERVER_ERROR
}
