//! Streamed response relay.
//!
//! A streamed upstream response is held back until its first chunk arrives
//! (or, for SSE, one heartbeat interval passes). Up to that point nothing has reached
//! the client and the attempt can still be retried. After it, the response
//! is committed: chunks are relayed as they arrive, SSE upstreams get
//! `: ping` comments during silence, and an upstream error just ends the body.

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use futures::stream::{Stream, StreamExt};
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use crate::api::disconnect::DisconnectStream;
use crate::api::upstream::Disposition;
use crate::core::StreamCompletion;

/// SSE comment frame sent while the upstream is silent.
pub const HEARTBEAT_FRAME: &[u8] = b": ping\n\n";

type ChunkStream<E> = Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>;
type RelayBody = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

fn heartbeat_frame() -> Bytes {
    Bytes::from_static(HEARTBEAT_FRAME)
}

/// Next non-empty chunk.
async fn next_chunk<E>(chunks: &mut ChunkStream<E>) -> Option<Result<Bytes, E>> {
    loop {
        match chunks.next().await {
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            other => return other,
        }
    }
}

/// Wait for the commitment point, then hand back the client response.
///
/// `heartbeat` is `Some` only for SSE upstreams; `window` bounds the wait for
/// the first chunk. An SSE upstream still silent when the window closes is
/// committed behind a heartbeat frame. Any other silent stream, and any
/// upstream error inside the window, is retryable since the client has seen
/// nothing yet.
pub async fn commit_stream<S, E>(
    status: StatusCode,
    headers: HeaderMap,
    chunks: S,
    heartbeat: Option<Duration>,
    window: Duration,
) -> Result<Response, Disposition>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut chunks: ChunkStream<E> = Box::pin(chunks);

    let (lead, finished) = match tokio::time::timeout(window, next_chunk(&mut chunks)).await {
        Ok(Some(Ok(chunk))) => (Some(chunk), false),
        Ok(Some(Err(e))) => {
            tracing::warn!(error = %e, "Upstream stream failed before first byte");
            return Err(Disposition::Retryable(
                "upstream stream failed before first byte".to_string(),
            ));
        }
        Ok(None) => (None, true),
        Err(_) => match heartbeat {
            Some(_) => (Some(heartbeat_frame()), false),
            None => {
                return Err(Disposition::Retryable(
                    "upstream stream produced no data before timeout".to_string(),
                ))
            }
        },
    };

    tracing::debug!(
        status = status.as_u16(),
        sse = heartbeat.is_some(),
        first_chunk = lead.as_ref().map(|c| c.len()),
        "Committed streamed response"
    );

    let completion = StreamCompletion::new();
    let relay = relay_stream(chunks, lead, finished, heartbeat, completion.clone());
    let body = Body::from_stream(DisconnectStream::new(relay, completion));

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

struct RelayState<E> {
    upstream: ChunkStream<E>,
    lead: Option<Bytes>,
    finished: bool,
    heartbeat: Option<Duration>,
    completion: StreamCompletion,
}

/// Relay `upstream` after an optional lead chunk.
///
/// The relay never yields an error: an upstream failure after commitment is
/// logged and the body ends as if the upstream had closed.
fn relay_stream<E>(
    upstream: ChunkStream<E>,
    lead: Option<Bytes>,
    finished: bool,
    heartbeat: Option<Duration>,
    completion: StreamCompletion,
) -> RelayBody
where
    E: Display + Send + 'static,
{
    if finished {
        completion.mark_completed();
    }

    let state = RelayState {
        upstream,
        lead,
        finished,
        heartbeat,
        completion,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        if let Some(lead) = state.lead.take() {
            return Some((Ok(lead), state));
        }
        if state.finished {
            return None;
        }

        let next = match state.heartbeat {
            Some(interval) => {
                match tokio::time::timeout(interval, next_chunk(&mut state.upstream)).await {
                    Ok(next) => next,
                    Err(_) => return Some((Ok(heartbeat_frame()), state)),
                }
            }
            None => next_chunk(&mut state.upstream).await,
        };

        match next {
            Some(Ok(chunk)) => Some((Ok(chunk), state)),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Upstream stream broke after commit, ending body");
                state.completion.mark_completed();
                None
            }
            None => {
                state.completion.mark_completed();
                None
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;
    use std::io;

    fn chunk(data: &'static str) -> Result<Bytes, io::Error> {
        Ok(Bytes::from_static(data.as_bytes()))
    }

    fn sse_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
        headers
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_relays_all_chunks_in_order() {
        let upstream = futures::stream::iter(vec![chunk("data: a\n\n"), chunk(""), chunk("data: b\n\n")]);
        let response = commit_stream(
            StatusCode::OK,
            sse_headers(),
            upstream,
            Some(Duration::from_secs(5)),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        assert_eq!(body_text(response).await, "data: a\n\ndata: b\n\n");
    }

    #[tokio::test]
    async fn test_error_before_first_chunk_is_retryable() {
        let upstream = futures::stream::iter(vec![Err::<Bytes, _>(io::Error::other("reset"))]);
        let result = commit_stream(
            StatusCode::OK,
            sse_headers(),
            upstream,
            None,
            Duration::from_secs(5),
        )
        .await;

        match result {
            Err(disposition) => assert!(disposition.is_retryable()),
            Ok(_) => panic!("expected a retryable failure"),
        }
    }

    #[tokio::test]
    async fn test_error_after_commit_ends_body_silently() {
        let upstream = futures::stream::iter(vec![
            chunk("data: a\n\n"),
            Err(io::Error::other("reset")),
            chunk("data: never\n\n"),
        ]);
        let response = commit_stream(
            StatusCode::OK,
            sse_headers(),
            upstream,
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(body_text(response).await, "data: a\n\n");
    }

    #[tokio::test]
    async fn test_empty_upstream_commits_empty_body() {
        let upstream = futures::stream::iter(Vec::<Result<Bytes, io::Error>>::new());
        let response = commit_stream(
            StatusCode::CREATED,
            HeaderMap::new(),
            upstream,
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_text(response).await, "");
    }

    #[tokio::test]
    async fn test_heartbeat_during_silence() {
        let upstream = futures::stream::unfold(0u8, |step| async move {
            match step {
                0 => {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Some((chunk("data: late\n\n"), 1))
                }
                _ => None,
            }
        });

        let response = commit_stream(
            StatusCode::OK,
            sse_headers(),
            upstream,
            Some(Duration::from_millis(40)),
            Duration::from_millis(40),
        )
        .await
        .unwrap();

        let text = body_text(response).await;
        assert!(text.starts_with(": ping\n\n"), "got {:?}", text);
        assert!(text.ends_with("data: late\n\n"));
        assert!(text.matches(": ping\n\n").count() >= 2);
    }

    #[tokio::test]
    async fn test_no_heartbeat_for_non_sse() {
        let upstream = futures::stream::unfold(0u8, |step| async move {
            match step {
                0 => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Some((chunk("{\"ok\":true}"), 1))
                }
                _ => None,
            }
        });

        let response = commit_stream(
            StatusCode::OK,
            HeaderMap::new(),
            upstream,
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(body_text(response).await, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_silent_non_sse_stream_is_retryable() {
        let upstream = futures::stream::pending::<Result<Bytes, io::Error>>();
        let result = commit_stream(
            StatusCode::OK,
            HeaderMap::new(),
            upstream,
            None,
            Duration::from_millis(30),
        )
        .await;

        match result {
            Err(disposition) => assert!(disposition.is_retryable()),
            Ok(_) => panic!("a silent non-SSE stream must not commit"),
        }
    }

    #[tokio::test]
    async fn test_dropping_body_mid_stream_is_abandoned() {
        let upstream = futures::stream::iter(vec![chunk("data: a\n\n")])
            .chain(futures::stream::pending());
        let completion = StreamCompletion::new();
        let relay = relay_stream(Box::pin(upstream), None, false, None, completion.clone());
        let mut wrapped = DisconnectStream::new(relay, completion.clone());

        let first = wrapped.next().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from_static(b"data: a\n\n"));
        assert!(wrapped.is_abandoned());
        drop(wrapped);

        assert!(!completion.is_completed());
    }

    #[tokio::test]
    async fn test_relay_marks_completion_at_eof() {
        let upstream = futures::stream::iter(vec![chunk("data: a\n\n")]);
        let completion = StreamCompletion::new();
        let relay = relay_stream(Box::pin(upstream), None, false, None, completion.clone());
        let mut wrapped = DisconnectStream::new(relay, completion.clone());

        while wrapped.next().await.is_some() {}

        assert!(completion.is_completed());
        assert!(!wrapped.is_abandoned());
    }
}
