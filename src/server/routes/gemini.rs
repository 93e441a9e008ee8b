use super::{build_context, fingerprint_string, message_role, message_text, session_prefix};
use crate::error::GatewayError;
use crate::proxy::{RelayRequest, relay};
use crate::scheduler::SessionKey;
use crate::server::router::GatewayState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use sirius_schema::ParsedRequest;
use sirius_session_core::message_digest;

/// `POST /v1beta/models/{model}:generateContent` and
/// `:streamGenerateContent` — Gemini-shaped relay with digest-chain sticky
/// sessions.
pub async fn generate_handler(
    State(state): State<GatewayState>,
    Path(model_call): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (model, rpc) = match model_call.split_once(':') {
        Some((model, rpc)) => (model, rpc),
        None => (model_call.as_str(), "generateContent"),
    };
    if model.is_empty() {
        return GatewayError::InvalidRequest("model missing from path".to_string())
            .into_response();
    }
    let stream = rpc.starts_with("streamGenerateContent");

    let parsed = match ParsedRequest::parse_with_route(&body, model, stream) {
        Ok(parsed) => parsed,
        Err(e) => return GatewayError::Parse(e).into_response(),
    };

    let ctx = build_context(&headers, &parsed, None);

    // Digest chain over the conversation; single-turn bodies fall back to
    // the plain fingerprint binding.
    let chain: Vec<String> = parsed
        .messages
        .iter()
        .map(|m| message_digest(message_role(m), &message_text(m)))
        .collect();
    let session = if chain.is_empty() {
        Some(SessionKey::Fingerprint(fingerprint_string(
            &state, &headers, &parsed, "gemini",
        )))
    } else {
        Some(SessionKey::GeminiChain {
            prefix_hash: session_prefix(&state, &headers, &parsed, "gemini"),
            chain,
        })
    };

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
