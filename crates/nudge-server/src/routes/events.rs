use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures_core::Stream;
use nudge_bus::{ProactiveView, WireEvent};

use super::{resolve_user, UserQuery};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/stream", get(state_stream))
}

fn sse_event(event: &impl WireEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.data().to_string())
}

/// Profile and schedule snapshot first, then every live event for the user.
pub async fn state_stream(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let user_id = resolve_user(&state, query.user_id)?;
    let mut subscription = state
        .hub
        .subscribe(&user_id)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    tracing::debug!(user_id, subscription = subscription.id(), "state stream opened");

    let stream = async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            yield Ok(sse_event(&event));
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn proactive_stream(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let user_id = resolve_user(&state, query.user_id)?;
    let mut view =
        ProactiveView::new(&state.hub, &user_id).map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    let stream = async_stream::stream! {
        while let Some(frame) = view.next().await {
            yield Ok(sse_event(&frame));
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
