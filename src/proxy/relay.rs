use crate::error::{GatewayError, write_stream_error};
use crate::limiter::{SlotGuard, WaitGuard};
use crate::proxy::endpoints::{build_headers, endpoints_for};
use crate::proxy::respond::{json_response, stream_response};
use crate::proxy::upstream_retry::post_json_with_retry;
use crate::ratelimit::should_failover;
use crate::scheduler::{RequestContext, Selected, SelectOutcome, SessionKey, WaitPlan};
use crate::server::router::GatewayState;
use crate::accounts::{Account, AccountKind};
use axum::response::Response;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};
use sirius_schema::{ScrubLevel, is_signature_failure, scrub_for_retry};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const WAIT_POLL: Duration = Duration::from_millis(200);
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RelayRequest {
    pub ctx: RequestContext,
    pub session: Option<SessionKey>,
    pub parsed: sirius_schema::ParsedRequest,
}

/// Drive one client request end-to-end: select an account, call upstream,
/// feed failures back into the status machine, and fail over within budget.
pub async fn relay(state: &GatewayState, req: RelayRequest) -> Response {
    let stream = req.parsed.stream;
    match relay_inner(state, req).await {
        Ok(resp) => resp,
        Err(err) => {
            let (status, body) = err.to_wire();
            write_stream_error(status, &body.inner.kind, &body.inner.message, stream)
        }
    }
}

async fn relay_inner(state: &GatewayState, req: RelayRequest) -> Result<Response, GatewayError> {
    let model = req.parsed.model.clone();

    // Budget: bounded by both the configured constant and how many distinct
    // accounts could possibly serve this request. No account is tried twice.
    let candidate_count = state
        .scheduler
        .candidate_count(&req.ctx, &model)
        .await
        .unwrap_or(1);
    let budget = state
        .cfg
        .upstream
        .retry_budget
        .min(candidate_count)
        .max(1);

    let mut excluded: HashSet<i64> = HashSet::new();
    let mut body = req.parsed.body.clone();
    let mut scrubs: u8 = 0;
    let mut last_err: Option<GatewayError> = None;

    for attempt in 0..budget {
        let outcome = match state
            .scheduler
            .select(&req.ctx, req.session.as_ref(), &model, &excluded)
            .await
        {
            Ok(outcome) => outcome,
            // Pool exhausted mid-retry: the upstream failure that burned the
            // last account is the more useful error.
            Err(select_err) => return Err(last_err.unwrap_or(select_err)),
        };

        let selected = match outcome {
            SelectOutcome::Ready(selected) => selected,
            SelectOutcome::Wait(plan) => {
                info!(
                    account.id = plan.account.id,
                    position = plan.waiting_position,
                    estimated_ms = plan.estimated_wait.as_millis() as u64,
                    "queueing behind account"
                );
                wait_for_slot(state, &req.ctx, plan).await?
            }
        };

        let account = selected.account;
        let guard = SlotGuard::new(
            state.limiter.clone(),
            account.id,
            req.ctx.request_id.clone(),
            req.ctx.user_id.clone(),
        );

        let Some(token) = upstream_token(state, &account) else {
            warn!(account.id = account.id, "account has no usable access token");
            let _ = state
                .store
                .set_error(account.id, "no usable access token".to_string())
                .await;
            excluded.insert(account.id);
            continue;
        };

        let endpoints = match endpoints_for(
            &account,
            &model,
            &state.cfg.upstream.allowed_base_hosts,
        ) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(account.id = account.id, error = %e, "account endpoint rejected");
                excluded.insert(account.id);
                last_err = Some(e);
                continue;
            }
        };
        let headers = build_headers(&account, &token, req.parsed.thinking_enabled)?;
        let payload = build_payload(&account, &model, &body, selected.session_uuid.as_deref());

        debug!(
            account.id = account.id,
            attempt,
            req.model = %model,
            req.stream = req.parsed.stream,
            url = %endpoints.select(req.parsed.stream),
            "posting upstream"
        );
        crate::utils::logging::with_pretty_json_debug(&payload, |pretty_payload| {
            debug!(
                account.id = account.id,
                req.model = %model,
                body = %pretty_payload,
                "prepared upstream payload"
            );
        });

        let resp = match post_json_with_retry(
            account.platform.as_str(),
            &state.client,
            endpoints.select(req.parsed.stream),
            Some(headers),
            &payload,
        )
        .await
        {
            Ok(resp) => resp,
            Err(e) => {
                // Transport failure, or a 5xx that survived the inner retry.
                if let Some(status) = e.status() {
                    let _ = state
                        .machine
                        .observe(&account, &model, status, &HeaderMap::new(), "")
                        .await;
                }
                warn!(account.id = account.id, error = %e, "upstream call failed");
                excluded.insert(account.id);
                last_err = Some(GatewayError::Reqwest(e));
                continue;
            }
        };

        let status = resp.status();
        if status.is_success() {
            state
                .machine
                .observe(&account, &model, status, resp.headers(), "")
                .await?;
            if req.parsed.stream {
                return Ok(stream_response(resp, account.platform, guard));
            }
            return json_response(resp, guard).await;
        }

        let resp_headers = resp.headers().clone();
        let body_text = match resp.bytes().await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        };
        let disposition = state
            .machine
            .observe(&account, &model, status, &resp_headers, &body_text)
            .await?;
        guard.release();

        warn!(
            account.id = account.id,
            %status,
            ?disposition,
            attempt,
            "upstream error"
        );

        // Retryable 400: thinking/tool signature replay rejected. Scrub the
        // conversation (mild first, then strong) and try a fresh account.
        if status == StatusCode::BAD_REQUEST && is_signature_failure(&body_text) && scrubs < 2 {
            let level = if scrubs == 0 {
                ScrubLevel::Mild
            } else {
                ScrubLevel::Strong
            };
            let changed = scrub_for_retry(&mut body, level);
            scrubs += 1;
            info!(account.id = account.id, ?level, changed, "scrubbed body for retry");
            excluded.insert(account.id);
            last_err = Some(GatewayError::UpstreamStatus(status));
            continue;
        }

        if should_failover(status) {
            excluded.insert(account.id);
            last_err = Some(GatewayError::UpstreamStatus(status));
            continue;
        }

        // Not worth another account (plain 400 and friends): surface as-is.
        return Err(GatewayError::UpstreamStatus(status));
    }

    Err(last_err.unwrap_or(GatewayError::NoAvailableAccounts {
        hint: "retry budget exhausted".to_string(),
    }))
}

/// Queue behind a full account: poll for a freed slot while holding a
/// waiting-counter reservation (released on drop, including client cancel).
async fn wait_for_slot(
    state: &GatewayState,
    ctx: &RequestContext,
    plan: WaitPlan,
) -> Result<Selected, GatewayError> {
    let _wait = WaitGuard::new(state.limiter.clone(), plan.account.id);
    let deadline = Instant::now() + WAIT_TIMEOUT;

    loop {
        if state
            .limiter
            .acquire(plan.account.id, plan.account.concurrency, &ctx.request_id)
        {
            if let Some(user) = &ctx.user_id {
                if !state.limiter.user_acquire(user, &ctx.request_id) {
                    state.limiter.release(plan.account.id, &ctx.request_id);
                    return Err(GatewayError::NoAvailableAccounts {
                        hint: "user concurrency limit reached".to_string(),
                    });
                }
            }
            return Ok(Selected {
                account: plan.account,
                session_uuid: None,
            });
        }
        if Instant::now() >= deadline {
            return Err(GatewayError::NoAvailableAccounts {
                hint: "timed out waiting for a free slot".to_string(),
            });
        }
        tokio::time::sleep(WAIT_POLL).await;
    }
}

/// Resolve the upstream credential for an account: cached access token for
/// OAuth-family kinds, the literal key otherwise. Token refresh is an
/// external capability; an OAuth account without a token is unusable here.
fn upstream_token(state: &GatewayState, account: &Account) -> Option<Arc<str>> {
    match account.kind {
        AccountKind::ApiKey => account
            .credentials
            .get("api_key")
            .and_then(Value::as_str)
            .map(Arc::from),
        AccountKind::SetupToken => account
            .credentials
            .get("token")
            .and_then(Value::as_str)
            .map(Arc::from),
        AccountKind::Oauth => {
            if let Some(cached) = state.machine.tokens().get(account) {
                return Some(cached);
            }
            let token: Arc<str> = account
                .credentials
                .get("access_token")
                .and_then(Value::as_str)
                .map(Arc::from)?;
            state.machine.tokens().put(account, token.clone());
            Some(token)
        }
    }
}

/// Upstream payload for one account: requested model swapped for the
/// account's mapped name; Code-Assist flavored upstreams additionally wrap
/// the body as `{model, project, request}`.
fn build_payload(
    account: &Account,
    requested_model: &str,
    body: &Value,
    session_uuid: Option<&str>,
) -> Value {
    use crate::accounts::Platform;

    let upstream_model = account.upstream_model(requested_model).to_string();
    let mut payload = body.clone();
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("model".to_string(), json!(upstream_model));
    }

    let wrapped = matches!(account.platform, Platform::Antigravity)
        || (account.platform == Platform::Gemini
            && matches!(account.kind, AccountKind::Oauth | AccountKind::SetupToken));
    if !wrapped {
        return payload;
    }

    let mut request = payload;
    if let Some(obj) = request.as_object_mut() {
        obj.remove("model");
        if let Some(uuid) = session_uuid {
            obj.entry("sessionId".to_string())
                .or_insert_with(|| json!(uuid));
        }
    }
    json!({
        "model": upstream_model,
        "project": account.project_id().unwrap_or_default(),
        "request": request,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountStatus, Platform};
    use serde_json::Map;

    fn account(platform: Platform, kind: AccountKind) -> Account {
        Account {
            id: 1,
            name: "a".to_string(),
            platform,
            kind,
            priority: 1,
            schedulable: true,
            status: AccountStatus::Active,
            error_message: None,
            concurrency: 2,
            credentials: Map::new(),
            credential_generation: 0,
            last_used_at: None,
            rate_limit_reset_at: None,
            overload_until: None,
            temp_unschedulable_until: None,
            scoped_rate_limits: Default::default(),
            group_ids: Vec::new(),
            extra: Map::new(),
        }
    }

    #[test]
    fn payload_applies_model_mapping() {
        let mut acct = account(Platform::Anthropic, AccountKind::ApiKey);
        acct.credentials.insert(
            "model_mapping".to_string(),
            json!({"claude-3-5-sonnet-20241022": "claude-sonnet-backend"}),
        );
        let body = json!({"model": "claude-3-5-sonnet-20241022", "messages": []});

        let payload = build_payload(&acct, "claude-3-5-sonnet-20241022", &body, None);
        assert_eq!(payload["model"], json!("claude-sonnet-backend"));
        assert_eq!(payload["messages"], json!([]));
    }

    #[test]
    fn code_assist_payload_is_wrapped() {
        let mut acct = account(Platform::Gemini, AccountKind::Oauth);
        acct.credentials
            .insert("project_id".to_string(), json!("proj-1"));
        let body = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});

        let payload = build_payload(&acct, "gemini-2.5-pro", &body, Some("conv-1"));
        assert_eq!(payload["model"], json!("gemini-2.5-pro"));
        assert_eq!(payload["project"], json!("proj-1"));
        assert_eq!(payload["request"]["sessionId"], json!("conv-1"));
        assert!(payload["request"].get("model").is_none());
        assert_eq!(
            payload["request"]["contents"][0]["parts"][0]["text"],
            json!("hi")
        );
    }

    #[test]
    fn apikey_payload_stays_flat() {
        let acct = account(Platform::Gemini, AccountKind::ApiKey);
        let body = json!({"contents": []});
        let payload = build_payload(&acct, "gemini-2.5-pro", &body, None);
        assert!(payload.get("request").is_none());
        assert_eq!(payload["model"], json!("gemini-2.5-pro"));
    }
}
