pub mod admin;
pub mod gemini;
pub mod messages;
pub mod responses;

use crate::accounts::Platform;
use crate::scheduler::RequestContext;
use crate::server::router::{GatewayState, new_request_id};
use axum::http::HeaderMap;
use axum::http::header::USER_AGENT;
use serde_json::Value;
use sirius_schema::ParsedRequest;
use sirius_session_core::session_prefix_hash;

pub(crate) const CLAUDE_CODE_PREAMBLE: &str = "You are Claude Code";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Claude-Code requests are recognized by their CLI user agent or the
/// well-known system preamble.
pub(crate) fn is_claude_code_request(headers: &HeaderMap, parsed: &ParsedRequest) -> bool {
    let ua = header_str(headers, USER_AGENT.as_str()).unwrap_or("");
    if ua.starts_with("claude-cli") || ua.contains("claude-code") {
        return true;
    }

    match &parsed.system {
        Some(Value::String(s)) => s.starts_with(CLAUDE_CODE_PREAMBLE),
        Some(Value::Array(blocks)) => blocks.iter().any(|b| {
            b.get("text")
                .and_then(Value::as_str)
                .is_some_and(|t| t.starts_with(CLAUDE_CODE_PREAMBLE))
        }),
        _ => false,
    }
}

/// Build the explicit request-scoped context carried through selection.
pub(crate) fn build_context(
    headers: &HeaderMap,
    parsed: &ParsedRequest,
    force_platform: Option<Platform>,
) -> RequestContext {
    let request_id = header_str(headers, "x-request-id")
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(new_request_id);

    let group_id = header_str(headers, "x-group-id").and_then(|v| v.parse::<i64>().ok());

    RequestContext {
        request_id,
        group_id,
        group: None,
        force_platform,
        claude_code: is_claude_code_request(headers, parsed),
        user_id: parsed.metadata_user_id.clone(),
    }
}

/// Stable session prefix hash over (user, api-key, ip, user-agent, platform,
/// model). An explicit `x-session-id` header wins for fingerprint sessions.
pub(crate) fn session_prefix(
    state: &GatewayState,
    headers: &HeaderMap,
    parsed: &ParsedRequest,
    platform_tag: &str,
) -> u64 {
    let user = parsed.metadata_user_id.as_deref().unwrap_or("");
    // The inbound key is uniform per deployment; still folded in so distinct
    // keys (when proxied through) never share a session.
    let api_key = header_str(headers, "x-api-key")
        .or_else(|| header_str(headers, "x-goog-api-key"))
        .or_else(|| header_str(headers, "authorization"))
        .unwrap_or_else(|| state.gateway_key.as_ref());
    let ip = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .or_else(|| header_str(headers, "x-real-ip"))
        .unwrap_or("");
    let ua = header_str(headers, USER_AGENT.as_str()).unwrap_or("");

    session_prefix_hash(user, api_key, ip, ua, platform_tag, &parsed.model)
}

pub(crate) fn fingerprint_string(
    state: &GatewayState,
    headers: &HeaderMap,
    parsed: &ParsedRequest,
    platform_tag: &str,
) -> String {
    if let Some(explicit) = header_str(headers, "x-session-id").filter(|v| !v.is_empty()) {
        return explicit.to_string();
    }
    format!("{:016x}", session_prefix(state, headers, parsed, platform_tag))
}

pub(crate) fn message_role(msg: &Value) -> &str {
    msg.get("role").and_then(Value::as_str).unwrap_or("user")
}

/// Flatten one message's content to the text the digest chain hashes:
/// plain-string content as-is, block/part arrays joined by newlines.
pub(crate) fn message_text(msg: &Value) -> String {
    if let Some(s) = msg.get("content").and_then(Value::as_str) {
        return s.to_string();
    }
    let parts = msg
        .get("content")
        .or_else(|| msg.get("parts"))
        .and_then(Value::as_array);
    parts
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> ParsedRequest {
        ParsedRequest::parse(serde_json::to_string(&v).unwrap().as_bytes()).unwrap()
    }

    #[test]
    fn claude_code_detected_from_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, "claude-cli/1.0.30 (cli)".parse().unwrap());
        let parsed = parse(json!({"model": "claude-3-5-sonnet-20241022", "messages": []}));
        assert!(is_claude_code_request(&headers, &parsed));
    }

    #[test]
    fn claude_code_detected_from_system_preamble() {
        let parsed = parse(json!({
            "model": "claude-3-5-sonnet-20241022",
            "system": [{"type": "text", "text": "You are Claude Code, Anthropic's CLI."}],
            "messages": []
        }));
        assert!(is_claude_code_request(&HeaderMap::new(), &parsed));

        let plain = parse(json!({"model": "claude-3-5-sonnet-20241022", "messages": []}));
        assert!(!is_claude_code_request(&HeaderMap::new(), &plain));
    }

    #[test]
    fn message_text_flattens_blocks_and_parts() {
        assert_eq!(
            message_text(&json!({"role": "user", "content": "plain"})),
            "plain"
        );
        assert_eq!(
            message_text(&json!({"role": "user", "content": [
                {"type": "text", "text": "a"},
                {"type": "text", "text": "b"}
            ]})),
            "a\nb"
        );
        assert_eq!(
            message_text(&json!({"role": "user", "parts": [{"text": "gemini"}]})),
            "gemini"
        );
    }
}
