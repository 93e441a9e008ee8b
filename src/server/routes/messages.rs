use super::{build_context, fingerprint_string};
use crate::error::GatewayError;
use crate::proxy::{RelayRequest, relay};
use crate::scheduler::SessionKey;
use crate::server::router::GatewayState;
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use sirius_schema::ParsedRequest;

/// `POST /v1/messages` — Anthropic-shaped chat relay.
pub async fn messages_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let parsed = match ParsedRequest::parse(&body) {
        Ok(parsed) => parsed,
        Err(e) => return GatewayError::Parse(e).into_response(),
    };

    let ctx = build_context(&headers, &parsed, None);
    let session = Some(SessionKey::Fingerprint(fingerprint_string(
        &state,
        &headers,
        &parsed,
        "anthropic",
    )));

    relay(
        &state,
        RelayRequest {
            ctx,
            session,
            parsed,
        },
    )
    .await
}
