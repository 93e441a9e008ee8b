use serde_json::{Value, json};

/// How aggressively to rewrite a request body before a retry.
///
/// `Mild` strips thinking material only; `Strong` additionally flattens tool
/// traffic to plain text. Both disable top-level `thinking` so the retried
/// conversation cannot trip signature validation again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubLevel {
    Mild,
    Strong,
}

const EMPTY_CONTENT_PLACEHOLDER: &str = "(content removed)";

/// Markers upstreams use when rejecting a replayed thinking/tool signature.
/// A 400 whose body matches any of these is worth retrying with a scrubbed
/// body instead of failing the client request.
const SIGNATURE_FAILURE_MARKERS: &[&str] = &[
    "thinking.signature",
    "redacted_thinking",
    "signature_validation",
    "invalid signature",
    "Invalid `signature`",
    "tool_use.signature",
    "thought_signature",
];

pub fn is_signature_failure(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    SIGNATURE_FAILURE_MARKERS
        .iter()
        .any(|m| lowered.contains(&m.to_ascii_lowercase()))
}

/// Rewrite `body` in place for a retry. Returns true when anything changed;
/// a conversation without thinking/tool blocks is left untouched.
pub fn scrub_for_retry(body: &mut Value, level: ScrubLevel) -> bool {
    let Some(obj) = body.as_object_mut() else {
        return false;
    };

    let mut changed = obj.remove("thinking").is_some();

    if let Some(Value::Array(messages)) = obj.get_mut("messages") {
        for message in messages {
            changed |= scrub_message(message, level);
        }
    }

    changed
}

fn scrub_message(message: &mut Value, level: ScrubLevel) -> bool {
    let Some(Value::Array(blocks)) = message.get_mut("content") else {
        // String content carries no structured blocks.
        return false;
    };

    let mut changed = false;
    let mut kept = Vec::with_capacity(blocks.len());

    for block in blocks.drain(..) {
        match block.get("type").and_then(Value::as_str) {
            Some("thinking") => {
                changed = true;
                if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                    if !text.is_empty() {
                        kept.push(json!({"type": "text", "text": text}));
                    }
                }
            }
            Some("redacted_thinking") => {
                // Opaque payload; nothing salvageable.
                changed = true;
            }
            Some("tool_use") if level == ScrubLevel::Strong => {
                changed = true;
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let input = block
                    .get("input")
                    .map(|v| serde_json::to_string(v).unwrap_or_default())
                    .unwrap_or_default();
                kept.push(json!({
                    "type": "text",
                    "text": format!("[tool call: {name}] {input}"),
                }));
            }
            Some("tool_result") if level == ScrubLevel::Strong => {
                changed = true;
                let text = flatten_tool_result(&block);
                if !text.is_empty() {
                    kept.push(json!({"type": "text", "text": text}));
                }
            }
            _ => kept.push(block),
        }
    }

    if changed && kept.is_empty() {
        kept.push(json!({"type": "text", "text": EMPTY_CONTENT_PLACEHOLDER}));
    }

    *blocks = kept;
    changed
}

fn flatten_tool_result(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mild_scrub_strips_top_level_thinking_and_converts_blocks() {
        let mut body = json!({
            "model": "claude-3-5-sonnet-20241022",
            "thinking": {"type": "enabled", "budget_tokens": 2048},
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "let me think", "signature": "sig"},
                    {"type": "text", "text": "answer"}
                ]}
            ]
        });

        assert!(scrub_for_retry(&mut body, ScrubLevel::Mild));
        assert!(body.get("thinking").is_none());
        assert_eq!(
            body["messages"][1]["content"],
            json!([
                {"type": "text", "text": "let me think"},
                {"type": "text", "text": "answer"}
            ])
        );
    }

    #[test]
    fn redacted_only_content_gets_placeholder() {
        let mut body = json!({
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "redacted_thinking", "data": "opaque"}
                ]}
            ]
        });

        assert!(scrub_for_retry(&mut body, ScrubLevel::Mild));
        assert_eq!(
            body["messages"][0]["content"],
            json!([{"type": "text", "text": "(content removed)"}])
        );
    }

    #[test]
    fn mild_scrub_keeps_tool_blocks() {
        let mut body = json!({
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "search", "input": {"q": "x"}}
                ]}
            ]
        });

        assert!(!scrub_for_retry(&mut body, ScrubLevel::Mild));
        assert_eq!(
            body["messages"][0]["content"][0]["type"],
            json!("tool_use")
        );
    }

    #[test]
    fn strong_scrub_flattens_tool_use_and_result() {
        let mut body = json!({
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "search", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": [
                        {"type": "text", "text": "result line"}
                    ]}
                ]}
            ]
        });

        assert!(scrub_for_retry(&mut body, ScrubLevel::Strong));
        assert_eq!(
            body["messages"][0]["content"],
            json!([{"type": "text", "text": "[tool call: search] {\"q\":\"x\"}"}])
        );
        assert_eq!(
            body["messages"][1]["content"],
            json!([{"type": "text", "text": "result line"}])
        );
    }

    #[test]
    fn clean_body_round_trips_unchanged() {
        let original = json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": "plain"},
                {"role": "assistant", "content": [{"type": "text", "text": "reply"}]}
            ]
        });
        let mut body = original.clone();

        assert!(!scrub_for_retry(&mut body, ScrubLevel::Strong));
        assert_eq!(body, original);
    }

    #[test]
    fn signature_failure_markers_match() {
        assert!(is_signature_failure(
            r#"{"error":{"type":"invalid_request_error","message":"messages.1.content.0.thinking.signature: Invalid signature"}}"#
        ));
        assert!(is_signature_failure("thought_signature mismatch"));
        assert!(!is_signature_failure(
            r#"{"error":{"type":"invalid_request_error","message":"max_tokens too large"}}"#
        ));
    }
}
