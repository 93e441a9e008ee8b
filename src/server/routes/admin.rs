use crate::accounts::Platform;
use crate::error::{ErrorBody, GatewayError};
use crate::server::router::GatewayState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Instant;

fn probe_url(platform: Platform) -> &'static str {
    match platform {
        Platform::Anthropic => "https://api.anthropic.com/",
        Platform::Openai => "https://api.openai.com/",
        Platform::Gemini => "https://generativelanguage.googleapis.com/",
        Platform::Antigravity => "https://daily-cloudcode-pa.googleapis.com/",
        Platform::Sora => "https://sora.chatgpt.com/",
    }
}

/// `POST /accounts/{id}/test` — cooldown-guarded upstream reachability
/// probe. Repeated tests inside the cooldown window are rejected.
pub async fn account_test_handler(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Response, GatewayError> {
    if let Err(remaining) = state.test_cooldown.try_begin(id) {
        let body = ErrorBody::new(
            "rate_limit_error",
            format!("account test cooling down; retry in {}s", remaining.as_secs().max(1)),
        );
        return Ok((StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response());
    }

    let account = state
        .store
        .get_account(id)
        .await?
        .ok_or_else(|| GatewayError::InvalidRequest(format!("account {id} not found")))?;

    let start = Instant::now();
    let result = state.client.head(probe_url(account.platform)).send().await;
    let latency_ms = start.elapsed().as_millis() as u64;

    let (ok, status) = match result {
        Ok(resp) => (!resp.status().is_server_error(), Some(resp.status().as_u16())),
        Err(_) => (false, None),
    };

    Ok(Json(json!({
        "id": id,
        "platform": account.platform.as_str(),
        "ok": ok,
        "status": status,
        "latency_ms": latency_ms,
    }))
    .into_response())
}
