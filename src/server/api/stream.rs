// SSE stream endpoint
//
// Emits one `new_observation` frame per committed observation. Frames are
// published by the response processor after the relational commit, so a
// subscriber can never see an observation the store does not hold.

use crate::server::WorkerState;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// GET /stream
pub async fn get_stream(
    State(state): State<WorkerState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.frames.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|frame| match frame {
        Ok(frame) => match serde_json::to_string(&frame) {
            Ok(json) => Some(Ok(Event::default().data(json))),
            Err(e) => {
                tracing::warn!("Could not serialize stream frame: {}", e);
                None
            }
        },
        // A lagged subscriber missed frames; skip and continue.
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            tracing::debug!("SSE subscriber lagged by {} frames", missed);
            None
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
