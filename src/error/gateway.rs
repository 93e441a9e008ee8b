use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error as ThisError;

use super::IsRetryable;

#[derive(Debug, ThisError)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request parse error: {0}")]
    Parse(#[from] sirius_schema::ParseError),

    #[error("no available accounts")]
    NoAvailableAccounts { hint: String },

    #[error("group {group_id} is restricted to Claude Code requests")]
    ClaudeCodeOnly { group_id: i64 },

    #[error("group fallback chain contains a cycle at group {group_id}")]
    GroupFallbackCycle { group_id: i64 },

    #[error("group {0} not found")]
    GroupNotFound(i64),

    #[error("upstream error with status: {0}")]
    UpstreamStatus(StatusCode),

    #[error("stream protocol error: {0}")]
    StreamProtocol(String),

    #[error("account base_url rejected: {0}")]
    InvalidBaseUrl(String),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("actor error: {0}")]
    Actor(String),

    #[error("unexpected error: {0}")]
    Internal(String),
}

/// Standardized API error payload: `{"error":{"type":…,"message":…}}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorObject {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "error")]
    pub inner: ErrorObject,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            inner: ErrorObject {
                kind: kind.into(),
                message: message.into(),
            },
        }
    }
}

impl GatewayError {
    /// HTTP status + wire body for this error. Internal details never leak;
    /// they are logged at the `IntoResponse` boundary instead.
    pub fn to_wire(&self) -> (StatusCode, ErrorBody) {
        match self {
            GatewayError::InvalidRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody::new("invalid_request_error", msg.clone()),
            ),

            GatewayError::Parse(e) => (
                StatusCode::BAD_REQUEST,
                ErrorBody::new("invalid_request_error", e.to_string()),
            ),

            GatewayError::NoAvailableAccounts { hint } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody::new(
                    "no_available_accounts",
                    if hint.is_empty() {
                        "no available accounts".to_string()
                    } else {
                        format!("no available accounts ({hint})")
                    },
                ),
            ),

            GatewayError::ClaudeCodeOnly { .. } => (
                StatusCode::FORBIDDEN,
                ErrorBody::new(
                    "claude_code_only",
                    "this group only serves Claude Code requests",
                ),
            ),

            GatewayError::UpstreamStatus(status) => {
                let (kind, message) = match *status {
                    StatusCode::TOO_MANY_REQUESTS => {
                        ("rate_limit_error", "Upstream rate limit exceeded.")
                    }
                    StatusCode::UNAUTHORIZED => {
                        ("authentication_error", "Upstream authentication failed.")
                    }
                    StatusCode::FORBIDDEN => ("permission_error", "Upstream permission denied."),
                    StatusCode::NOT_FOUND => ("not_found_error", "Upstream resource not found."),
                    _ => ("upstream_error", "An upstream error occurred."),
                };
                (*status, ErrorBody::new(kind, message))
            }

            GatewayError::StreamProtocol(_)
            | GatewayError::Reqwest(_)
            | GatewayError::InvalidBaseUrl(_) => (
                StatusCode::BAD_GATEWAY,
                ErrorBody::new("upstream_error", "Upstream service error."),
            ),

            GatewayError::Json(_) => (
                StatusCode::BAD_GATEWAY,
                ErrorBody::new("upstream_error", "Failed to parse upstream response."),
            ),

            GatewayError::GroupFallbackCycle { .. }
            | GatewayError::GroupNotFound(_)
            | GatewayError::Database(_)
            | GatewayError::Actor(_)
            | GatewayError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new("internal_error", "An internal server error occurred."),
            ),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = self.to_wire();
        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "request failed");
        } else {
            tracing::warn!(error = %self, status = %status, "request rejected");
        }
        (status, Json(body)).into_response()
    }
}

impl IsRetryable for GatewayError {
    fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Reqwest(_) => true,
            GatewayError::UpstreamStatus(status) => matches!(
                *status,
                StatusCode::TOO_MANY_REQUESTS
                    | StatusCode::UNAUTHORIZED
                    | StatusCode::FORBIDDEN
                    | StatusCode::NOT_FOUND
            ),
            _ => false,
        }
    }
}
