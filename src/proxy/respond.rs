use crate::accounts::Platform;
use crate::error::error_event_frame;
use crate::limiter::SlotGuard;
use axum::{
    body::{Body, Bytes},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt, stream};
use serde_json::Value;
use sirius_schema::{StreamEvent, translate_anthropic, translate_gemini, translate_openai};
use std::pin::Pin;
use std::time::Duration;
use tracing::{error, warn};

const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn frame_data(json: &str) -> Bytes {
    Bytes::from(format!("data: {json}\n\n"))
}

pub(crate) fn frame_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

fn translate(platform: Platform, data: &Value) -> Option<StreamEvent> {
    match platform {
        Platform::Anthropic => translate_anthropic(data),
        Platform::Openai => translate_openai(data),
        // Antigravity speaks the Gemini chunk schema.
        Platform::Gemini | Platform::Antigravity => translate_gemini(data),
        Platform::Sora => None,
    }
}

struct RelayStream {
    events: Pin<
        Box<dyn Stream<Item = Result<eventsource_stream::Event, eventsource_stream::EventStreamError<reqwest::Error>>> + Send>,
    >,
    platform: Platform,
    /// Keeps the concurrency slot held for exactly the stream's lifetime;
    /// dropping the response body (client cancel) releases it.
    _guard: SlotGuard,
    finished: bool,
    sent_terminal: bool,
}

/// Forward one upstream SSE response to the client in the common event
/// shape. Frames are emitted line-by-line; the full response is never
/// buffered.
pub(crate) fn stream_response(
    upstream: reqwest::Response,
    platform: Platform,
    guard: SlotGuard,
) -> Response {
    let ctx = RelayStream {
        events: Box::pin(upstream.bytes_stream().eventsource()),
        platform,
        _guard: guard,
        finished: false,
        sent_terminal: false,
    };

    let body_stream = stream::unfold(ctx, |mut ctx| async move {
        if ctx.finished {
            return None;
        }
        loop {
            let next = tokio::time::timeout(SSE_IDLE_TIMEOUT, ctx.events.next()).await;
            let chunk = match next {
                Err(_) => {
                    error!("upstream SSE stream idle timeout (> 60s)");
                    ctx.finished = true;
                    // Error event only when no terminal frame went out yet.
                    if ctx.sent_terminal {
                        return None;
                    }
                    return Some((
                        Bytes::from(error_event_frame("upstream_error", "stream idle timeout")),
                        ctx,
                    ));
                }
                Ok(None) => {
                    // Upstream closed without a terminal event; close the
                    // client stream cleanly.
                    ctx.finished = true;
                    if ctx.sent_terminal {
                        return None;
                    }
                    ctx.sent_terminal = true;
                    return Some((frame_done(), ctx));
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "upstream SSE stream broke mid-flight");
                    ctx.finished = true;
                    if ctx.sent_terminal {
                        return None;
                    }
                    return Some((
                        Bytes::from(error_event_frame("upstream_error", "stream interrupted")),
                        ctx,
                    ));
                }
                Ok(Some(Ok(event))) => event,
            };

            if chunk.data.is_empty() {
                continue;
            }
            if chunk.data == "[DONE]" {
                ctx.finished = true;
                ctx.sent_terminal = true;
                return Some((frame_done(), ctx));
            }

            let Ok(value) = serde_json::from_str::<Value>(&chunk.data) else {
                continue;
            };
            let Some(event) = translate(ctx.platform, &value) else {
                continue;
            };

            let done = matches!(event, StreamEvent::Done);
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "stream event serialization failed");
                    continue;
                }
            };

            let mut payload = frame_data(&json).to_vec();
            if done {
                ctx.finished = true;
                ctx.sent_terminal = true;
                payload.extend_from_slice(&frame_done());
            }
            return Some((Bytes::from(payload), ctx));
        }
    })
    .map(Ok::<_, std::convert::Infallible>);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Pass a non-streaming upstream JSON response through. The slot guard is
/// dropped (released) once the body has been read.
pub(crate) async fn json_response(
    upstream: reqwest::Response,
    guard: SlotGuard,
) -> Result<Response, crate::error::GatewayError> {
    let status = upstream.status();
    let body: Value = upstream.json().await?;
    guard.release();
    Ok((status, axum::Json(body)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_follow_wire_contract() {
        assert_eq!(frame_data("{\"type\":\"done\"}"), "data: {\"type\":\"done\"}\n\n");
        assert_eq!(frame_done(), "data: [DONE]\n\n");
    }

    #[test]
    fn translate_dispatches_by_platform() {
        let anthropic = serde_json::json!({
            "type": "content_block_delta",
            "delta": {"type": "text_delta", "text": "x"}
        });
        assert!(matches!(
            translate(Platform::Anthropic, &anthropic),
            Some(StreamEvent::Text { .. })
        ));

        let gemini = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "y"}]}}]
        });
        assert!(matches!(
            translate(Platform::Antigravity, &gemini),
            Some(StreamEvent::Text { .. })
        ));
    }
}
