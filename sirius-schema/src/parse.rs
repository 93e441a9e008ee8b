use serde_json::Value;

// The parser is the only layer that deserializes the client body. Everything
// downstream (scheduler, proxy, scrubber) works off this struct or the raw
// `body` Value it retains.

/// One-shot projection of a client chat/completion request body.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    /// The full body as parsed. Retained so later layers never re-deserialize.
    pub body: Value,
    pub model: String,
    pub stream: bool,
    pub metadata_user_id: Option<String>,
    /// The `system` value as sent. `None` both when absent and when `null`;
    /// use `has_system` to tell the two apart.
    pub system: Option<Value>,
    /// True whenever the `system` key was present, even with a `null` value,
    /// so downstream layers do not silently inject a default prompt.
    pub has_system: bool,
    pub messages: Vec<Value>,
    pub thinking_enabled: bool,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidJson(String),
    NotAnObject,
    MissingModel,
    ModelNotAString,
    StreamNotABool,
    MessagesNotAnArray,
    MaxTokensNotIntegral,
    MaxTokensNegative,
    MaxTokensOutOfRange,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ParseError::InvalidJson(e) => return write!(f, "invalid JSON: {e}"),
            ParseError::NotAnObject => "request body must be a JSON object",
            ParseError::MissingModel => "missing required field: model",
            ParseError::ModelNotAString => "field `model` must be a string",
            ParseError::StreamNotABool => "field `stream` must be a boolean",
            ParseError::MessagesNotAnArray => "field `messages` must be an array",
            ParseError::MaxTokensNotIntegral => "field `max_tokens` must be an integer",
            ParseError::MaxTokensNegative => "field `max_tokens` must be non-negative",
            ParseError::MaxTokensOutOfRange => "field `max_tokens` is out of range",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ParseError {}

impl ParsedRequest {
    /// Parse a raw UTF-8 JSON body. `model` must be present in the body.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        Self::parse_inner(bytes, None, None)
    }

    /// Parse a body whose model and stream flag come from the request path
    /// (Gemini-style `/v1beta/models/{model}:streamGenerateContent`). A
    /// `model` present in the body still wins over the hint.
    pub fn parse_with_route(
        bytes: &[u8],
        model_hint: &str,
        stream_hint: bool,
    ) -> Result<Self, ParseError> {
        Self::parse_inner(bytes, Some(model_hint), Some(stream_hint))
    }

    fn parse_inner(
        bytes: &[u8],
        model_hint: Option<&str>,
        stream_hint: Option<bool>,
    ) -> Result<Self, ParseError> {
        let body: Value =
            serde_json::from_slice(bytes).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        let obj = body.as_object().ok_or(ParseError::NotAnObject)?;

        let model = match obj.get("model") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(ParseError::ModelNotAString),
            None => model_hint
                .map(str::to_string)
                .ok_or(ParseError::MissingModel)?,
        };

        let stream = match obj.get("stream") {
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(ParseError::StreamNotABool),
            None => stream_hint.unwrap_or(false),
        };

        let max_tokens = match obj.get("max_tokens") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(parse_max_tokens(n)?),
            Some(_) => return Err(ParseError::MaxTokensNotIntegral),
        };

        let has_system =
            obj.contains_key("system") || obj.contains_key("systemInstruction");
        let system = obj
            .get("system")
            .or_else(|| obj.get("systemInstruction"))
            .filter(|v| !v.is_null())
            .cloned();

        // Anthropic uses `messages`, the OpenAI responses shape uses `input`,
        // Gemini uses `contents`. All are role-tagged turn arrays.
        let messages = match obj
            .get("messages")
            .or_else(|| obj.get("input"))
            .or_else(|| obj.get("contents"))
        {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => return Err(ParseError::MessagesNotAnArray),
        };

        let thinking_enabled = obj
            .get("thinking")
            .and_then(|t| t.get("type"))
            .and_then(Value::as_str)
            == Some("enabled");

        let metadata_user_id = obj
            .get("metadata")
            .and_then(|m| m.get("user_id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            body,
            model,
            stream,
            metadata_user_id,
            system,
            has_system,
            messages,
            thinking_enabled,
            max_tokens,
        })
    }
}

fn parse_max_tokens(n: &serde_json::Number) -> Result<u32, ParseError> {
    if let Some(u) = n.as_u64() {
        return u32::try_from(u).map_err(|_| ParseError::MaxTokensOutOfRange);
    }
    if n.as_i64().is_some() {
        // as_u64 failed for an i64 value, so it is negative.
        return Err(ParseError::MaxTokensNegative);
    }
    // Remaining case: a double. JSON cannot carry NaN/inf, but 4096.5 or
    // 1e300 must not be silently truncated.
    Err(ParseError::MaxTokensNotIntegral)
}
