use crate::core::logging::get_request_id;
use crate::core::StreamCompletion;
use axum::body::Bytes;
use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A body stream that notices when it is dropped before the relay finished.
///
/// Hyper drops the response body as soon as the client goes away, which in
/// turn drops the wrapped relay and the upstream response it owns.
pub struct DisconnectStream<S> {
    pub stream: S,
    pub completion: StreamCompletion,
    request_id: String,
}

impl<S> DisconnectStream<S> {
    /// Wrap `stream`, remembering the current request id for the drop log.
    pub fn new(stream: S, completion: StreamCompletion) -> Self {
        Self {
            stream,
            completion,
            request_id: get_request_id(),
        }
    }

    /// The client went away before the relay reached its end.
    pub fn is_abandoned(&self) -> bool {
        !self.completion.is_completed()
    }
}

impl<S, E> Stream for DisconnectStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl<S> Drop for DisconnectStream<S> {
    fn drop(&mut self) {
        if self.is_abandoned() {
            tracing::info!(
                request_id = %self.request_id,
                "Client disconnected during stream, upstream read cancelled"
            );
        }
    }
}
