// crates/dossier-server/src/web/stream.rs
// Bridge between pipeline event channels and the SSE wire
//
// Each event becomes `event: <name>\ndata: <json>\n\n`, flushed as it
// arrives. Dropping the response stream (client disconnect) drops the
// guard, which cancels the invocation's token; in-flight model calls
// observe it within their next await point.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use dossier_types::StreamEvent;
use futures::stream::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Interval for `: keepalive` comment lines, to defeat intermediary
/// buffering on silent stretches.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Channel capacity between a pipeline task and its SSE writer. Small:
/// the producer is client-paced through this buffer.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Wrap an event receiver as an SSE response, tying `cancel` to the
/// response stream's lifetime.
pub fn sse_response(
    mut rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // The guard is created eagerly and moved into the generator, so the
    // token fires even when the response is dropped before first poll.
    let guard = cancel.drop_guard();
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            yield Ok(to_wire(&event));
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

/// Translate one internal event to its wire form.
pub fn to_wire(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.data().to_string())
}
