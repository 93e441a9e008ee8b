use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Provider-agnostic stream event emitted to clients as `data: <json>` lines.
///
/// Every upstream schema (Anthropic SSE, OpenAI responses SSE, Gemini SSE) is
/// folded into this shape before it leaves the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First event of a conversation turn; carries the upstream model id.
    Start { model: String },
    Text { text: String },
    Thinking { text: String },
    ToolUse { name: String, input: Value },
    Done,
}

/// Map one Anthropic SSE data payload onto the common shape.
///
/// Events that carry no client-visible content (pings, block boundaries,
/// usage deltas) fold to `None` and are dropped from the outbound stream.
pub fn translate_anthropic(data: &Value) -> Option<StreamEvent> {
    match data.get("type").and_then(Value::as_str)? {
        "message_start" => {
            let model = data
                .get("message")
                .and_then(|m| m.get("model"))
                .and_then(Value::as_str)?
                .to_string();
            Some(StreamEvent::Start { model })
        }
        "content_block_start" => {
            let block = data.get("content_block")?;
            match block.get("type").and_then(Value::as_str)? {
                "tool_use" => Some(StreamEvent::ToolUse {
                    name: block.get("name").and_then(Value::as_str)?.to_string(),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                }),
                _ => None,
            }
        }
        "content_block_delta" => {
            let delta = data.get("delta")?;
            match delta.get("type").and_then(Value::as_str)? {
                "text_delta" => Some(StreamEvent::Text {
                    text: delta.get("text").and_then(Value::as_str)?.to_string(),
                }),
                "thinking_delta" => Some(StreamEvent::Thinking {
                    text: delta.get("thinking").and_then(Value::as_str)?.to_string(),
                }),
                _ => None,
            }
        }
        "message_stop" => Some(StreamEvent::Done),
        _ => None,
    }
}

/// Map one OpenAI responses-API SSE data payload onto the common shape.
pub fn translate_openai(data: &Value) -> Option<StreamEvent> {
    match data.get("type").and_then(Value::as_str)? {
        "response.created" => {
            let model = data
                .get("response")
                .and_then(|r| r.get("model"))
                .and_then(Value::as_str)?
                .to_string();
            Some(StreamEvent::Start { model })
        }
        "response.output_text.delta" => Some(StreamEvent::Text {
            text: data.get("delta").and_then(Value::as_str)?.to_string(),
        }),
        "response.reasoning_summary_text.delta" => Some(StreamEvent::Thinking {
            text: data.get("delta").and_then(Value::as_str)?.to_string(),
        }),
        "response.completed" => Some(StreamEvent::Done),
        _ => None,
    }
}

/// Map one Gemini `streamGenerateContent` chunk onto the common shape.
///
/// Gemini chunks are whole `GenerateContentResponse` objects; text parts may
/// be flagged `thought: true`. The terminal chunk carries a `finishReason`.
pub fn translate_gemini(data: &Value) -> Option<StreamEvent> {
    let candidate = data.get("candidates")?.get(0)?;

    if let Some(part) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.get(0))
    {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            let event = if part.get("thought").and_then(Value::as_bool) == Some(true) {
                StreamEvent::Thinking {
                    text: text.to_string(),
                }
            } else {
                StreamEvent::Text {
                    text: text.to_string(),
                }
            };
            return Some(event);
        }
        if let Some(call) = part.get("functionCall") {
            return Some(StreamEvent::ToolUse {
                name: call.get("name").and_then(Value::as_str)?.to_string(),
                input: call.get("args").cloned().unwrap_or(Value::Null),
            });
        }
    }

    if candidate.get("finishReason").and_then(Value::as_str).is_some() {
        return Some(StreamEvent::Done);
    }
    None
}
