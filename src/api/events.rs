use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::errors::LiveViewError;
use crate::state::AppState;

/// `GET /api/v1/events` — live SSE feed of pull progress/completion (C6). A
/// new connection first receives a full snapshot as synthetic progress
/// events, then incremental frames as the aggregator processes reports.
pub async fn stream_events(State(state): State<Arc<AppState>>) -> Result<Response, LiveViewError> {
    let (_, rx, guard) = state.viewers.register().await?;
    state.metrics.sse_clients.inc();

    let snapshot = state.aggregator.snapshot_events().await;
    let live = ReceiverStream::new(rx);

    let frames = futures::stream::iter(snapshot)
        .chain(live)
        .map(|event| Ok::<_, std::io::Error>(event.to_sse_frame()));

    // Keep the viewer guard (and its deregistration-on-drop) alive for the
    // lifetime of the response body, and drop the gauge back down with it.
    let body = Body::from_stream(GuardedStream {
        inner: frames,
        _guard: guard,
        sse_clients: state.metrics.sse_clients.clone(),
    });

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .expect("static headers are always valid")
        .into_response())
}

/// Wraps a frame stream together with the `ViewerGuard` so deregistration
/// happens when the HTTP response body is dropped, not before.
struct GuardedStream<S> {
    inner: S,
    _guard: crate::live::ViewerGuard,
    sse_clients: prometheus::Gauge,
}

impl<S> Drop for GuardedStream<S> {
    fn drop(&mut self) {
        self.sse_clients.dec();
    }
}

impl<S: futures::Stream + Unpin> futures::Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.inner).poll_next(cx)
    }
}
