use super::{build_context, fingerprint_string};
use crate::accounts::Platform;
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

/// `POST /responses` — OpenAI responses-shaped relay.
pub async fn responses_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let parsed = match ParsedRequest::parse(&body) {
        Ok(parsed) => parsed,
        Err(e) => return GatewayError::Parse(e).into_response(),
    };

    let ctx = build_context(&headers, &parsed, Some(Platform::Openai));
    let session = Some(SessionKey::Fingerprint(fingerprint_string(
        &state,
        &headers,
        &parsed,
        "openai",
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
