//! Server-Sent Events endpoint for the per-CR event stream.
//!
//! `GET /api/events/stream?cr_id=…` — replays from the client's offset
//! then switches to live without gap or duplicate. Reconnecting clients
//! send the standard `Last-Event-ID` header; it wins over the
//! `last_seen_id` query parameter. The stream closes on any terminal
//! event.

use super::SharedState;
use crate::errors::ApiError;
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Deserialize)]
pub struct StreamParams {
    pub cr_id: String,
    #[serde(default)]
    pub last_seen_id: Option<i64>,
}

pub async fn stream(
    State(state): State<SharedState>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.store.get_run(&params.cr_id)?;

    let last_seen = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok())
        .or(params.last_seen_id)
        .unwrap_or(0);

    let events = state.bus.stream_from(&params.cr_id, last_seen);
    let stream = ReceiverStream::new(events).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default()
            .id(event.sequence_id.to_string())
            .event(event.kind.event_type())
            .data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
