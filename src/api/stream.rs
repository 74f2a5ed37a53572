use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, warn};

use crate::api::ApiState;

/// Server-sent change notifications for one store key. The subscription is
/// dropped with the connection.
pub async fn stream_key(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut changes = state.dispatcher.store().subscribe(&key);
    debug!("Client subscribed to {}", key);

    let stream = async_stream::stream! {
        while let Some(change) = changes.recv().await {
            match serde_json::to_string(&change) {
                Ok(json) => yield Ok(Event::default().event("change").data(json)),
                Err(e) => warn!("Could not encode change to {}: {}", change.key, e),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)).text("keep-alive"))
}
