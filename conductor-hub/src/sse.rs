//! Server-Sent Events stream of hub events.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tracing::{debug, warn};

use crate::hub::HubEvent;
use crate::state::AppState;

/// SSE endpoint handler.
///
/// Each client gets its own hub subscription; a slow client only loses its
/// own events. Dropping the stream lets the hub prune the subscriber.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.hub.subscribe();
    debug!(subscriber = subscription.id(), "sse client connected");

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        while let Some(event) = subscription.recv().await {
            if let Some(sse_event) = to_sse_event(&event) {
                yield Ok(sse_event);
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn to_sse_event(event: &HubEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Event::default().event(event.event_type()).data(json)),
        Err(err) => {
            warn!(event = event.event_type(), err = %err, "failed to serialize event");
            None
        }
    }
}
