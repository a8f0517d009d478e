use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_core::Stream;
use nudge_core::{ChatError, ReplyEvent, EVENT_ANSWER, EVENT_DONE, EVENT_MESSAGE};
use nudge_memory::DEFAULT_HISTORY_LIMIT;
use nudge_schema::ChatRecord;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;

use super::{internal_error, resolve_user, UserQuery};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub user_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SendBody {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub reply: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(send_message))
        .route("/stream", post(stream_message))
        .route("/history", get(chat_history))
}

pub async fn chat_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<ChatRecord>>, StatusCode> {
    let user_id = resolve_user(&state, params.user_id)?;
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    state
        .chats
        .visible(&user_id, limit)
        .await
        .map(Json)
        .map_err(|e| internal_error("failed to load chat history", e))
}

pub async fn send_message(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    Json(body): Json<SendBody>,
) -> Result<Json<SendResponse>, StatusCode> {
    let user_id = resolve_user(&state, query.user_id)?;
    state
        .chat
        .send(&user_id, &body.text)
        .await
        .map(|reply| Json(SendResponse { reply }))
        .map_err(|err| chat_error_status(&user_id, err))
}

/// Streams the reply as SSE `message` frames, ending with `done` or `interrupt`.
pub async fn stream_message(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    Json(body): Json<SendBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let user_id = resolve_user(&state, query.user_id)?;
    let mut events = state
        .chat
        .stream(&user_id, &body.text)
        .await
        .map_err(|err| chat_error_status(&user_id, err))?;

    let stream = async_stream::stream! {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    if let Some(frame) = reply_frame(event) {
                        yield Ok(frame);
                    }
                }
                Err(error) => {
                    let data = json!({"message": format!("{error:#}")});
                    yield Ok(Event::default().event("error").data(data.to_string()));
                }
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn reply_frame(event: ReplyEvent) -> Option<Event> {
    let ReplyEvent { name, data } = event;
    if name.contains(['\n', '\r']) {
        return None;
    }
    let frame = match name.as_str() {
        EVENT_MESSAGE | EVENT_ANSWER => Event::default()
            .event(EVENT_MESSAGE)
            .data(json!({ "text": data }).to_string()),
        EVENT_DONE => Event::default().event(EVENT_DONE).data("[DONE]"),
        _ => Event::default().event(name).data(data),
    };
    Some(frame)
}

fn chat_error_status(user_id: &str, err: ChatError) -> StatusCode {
    match err {
        ChatError::EmptyMessage => StatusCode::BAD_REQUEST,
        err @ ChatError::Generation(_) => {
            tracing::warn!(user_id, error = %err, "passive reply failed");
            StatusCode::BAD_GATEWAY
        }
        ChatError::Storage(err) => internal_error("failed to store chat turn", err),
    }
}
