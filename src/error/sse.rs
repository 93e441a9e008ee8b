use super::gateway::ErrorBody;
use axum::{
    Json,
    body::Body,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

/// Render one terminal SSE error: an `error` event followed by the stream
/// terminator. The exact framing is part of the client contract:
///
/// ```text
/// event: error
/// data: {"error":{"type":"<code>","message":"<msg>"}}
///
/// data: [DONE]
///
/// ```
pub fn error_event_frame(code: &str, message: &str) -> String {
    let body = ErrorBody::new(code, message);
    let json = serde_json::to_string(&body)
        .unwrap_or_else(|_| r#"{"error":{"type":"internal_error","message":"serialize"}}"#.into());
    format!("event: error\ndata: {json}\n\ndata: [DONE]\n\n")
}

/// Write an error to the client in the representation the request asked for:
/// an SSE error event (HTTP 200, `text/event-stream`) for streaming requests,
/// a plain JSON error body with `status` otherwise.
pub fn write_stream_error(status: StatusCode, code: &str, message: &str, stream: bool) -> Response {
    if stream {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(error_event_frame(code, message)))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    (status, Json(ErrorBody::new(code, message))).into_response()
}
