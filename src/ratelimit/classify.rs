use crate::accounts::Account;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;
use std::time::Duration;

/// What one upstream response means for the issuing account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Success,
    RateLimited {
        reset_at: DateTime<Utc>,
    },
    /// 429 scoped to one model/quota; the account stays usable elsewhere.
    ScopedRateLimited {
        scope: String,
        reset_at: DateTime<Utc>,
    },
    Overloaded {
        until: DateTime<Utc>,
    },
    /// 401: credentials rejected upstream.
    AuthFailed,
    CloudflareChallenge {
        until: DateTime<Utc>,
        cf_ray: Option<String>,
    },
    /// Matched a per-account `temp_unschedulable_rules` entry.
    TempUnschedulable {
        until: DateTime<Utc>,
        reason: String,
    },
    /// Other 4xx/5xx: bubbles to the retry classifier without state change.
    Passthrough,
}

#[derive(Debug, Clone, Copy)]
pub struct ClassifyPolicy {
    pub overload_backoff: Duration,
    pub cloudflare_cooldown: Duration,
}

const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

const CLOUDFLARE_BODY_MARKERS: &[&str] = &[
    "just a moment",
    "cf-chl",
    "challenge-platform",
    "_cf_chl_opt",
    "attention required! | cloudflare",
];

/// Whether the scheduler should retry this request on a different account.
/// 400 means the request itself is bad and would fail anywhere.
pub fn should_failover(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::NOT_FOUND
            | StatusCode::TOO_MANY_REQUESTS
    ) || status.is_server_error()
}

pub fn classify(
    account: &Account,
    requested_model: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    now: DateTime<Utc>,
    policy: &ClassifyPolicy,
) -> Disposition {
    if status.is_success() {
        return Disposition::Success;
    }

    let body_json: Option<Value> = serde_json::from_str(body).ok();
    let error_obj = body_json.as_ref().and_then(|v| v.get("error"));
    let error_type = error_obj
        .and_then(|e| e.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let error_message = error_obj
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("");

    // Per-account operator rules win over the generic mapping.
    for rule in account.temp_unschedulable_rules() {
        if rule.status == status.as_u16()
            && !rule.keyword.is_empty()
            && body.contains(rule.keyword.as_str())
        {
            return Disposition::TempUnschedulable {
                until: now + chrono_duration(Duration::from_secs(rule.duration_secs)),
                reason: if rule.description.is_empty() {
                    format!("rule match on status {status}")
                } else {
                    rule.description
                },
            };
        }
    }

    if is_cloudflare_challenge(status, headers, body) {
        return Disposition::CloudflareChallenge {
            until: now + chrono_duration(policy.cloudflare_cooldown),
            cf_ray: headers
                .get("cf-ray")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        };
    }

    if status == StatusCode::UNAUTHORIZED {
        return Disposition::AuthFailed;
    }

    let looks_rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || error_type == "rate_limit_error"
        || error_type == "RESOURCE_EXHAUSTED";
    if looks_rate_limited {
        let reset_at = parse_reset_hint(headers, error_obj, now)
            .unwrap_or_else(|| now + chrono_duration(DEFAULT_RATE_LIMIT_COOLDOWN))
            .max(now);

        if let Some(scope) = rate_limit_scope(error_obj, error_message, requested_model) {
            return Disposition::ScopedRateLimited { scope, reset_at };
        }
        return Disposition::RateLimited { reset_at };
    }

    let overloaded = status.as_u16() == 529
        || error_type == "overloaded_error"
        || error_message.to_ascii_lowercase().contains("overloaded");
    if overloaded {
        return Disposition::Overloaded {
            until: now + chrono_duration(policy.overload_backoff),
        };
    }

    Disposition::Passthrough
}

fn is_cloudflare_challenge(status: StatusCode, headers: &HeaderMap, body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    if CLOUDFLARE_BODY_MARKERS.iter().any(|m| lowered.contains(m)) {
        return true;
    }
    status == StatusCode::FORBIDDEN && headers.contains_key("cf-ray")
}

/// Scope key for a 429 that does not poison the whole account: an explicit
/// `error.scope`, or the requested model when the upstream names it.
fn rate_limit_scope(
    error_obj: Option<&Value>,
    error_message: &str,
    requested_model: &str,
) -> Option<String> {
    if let Some(scope) = error_obj
        .and_then(|e| e.get("scope"))
        .and_then(Value::as_str)
    {
        return Some(scope.to_string());
    }
    if !requested_model.is_empty() && error_message.contains(requested_model) {
        return Some(requested_model.to_string());
    }
    None
}

/// Best-effort reset extraction: `Retry-After` (delta-seconds or HTTP-date),
/// unified reset headers (unix seconds), then JSON body hints.
fn parse_reset_hint(
    headers: &HeaderMap,
    error_obj: Option<&Value>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if let Some(raw) = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = raw.trim().parse::<i64>() {
            return Some(now + ChronoDuration::seconds(secs.max(0)));
        }
        if let Ok(when) = DateTime::parse_from_rfc2822(raw) {
            return Some(when.with_timezone(&Utc));
        }
    }

    for name in ["anthropic-ratelimit-unified-reset", "x-ratelimit-reset"] {
        if let Some(ts) = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
        {
            if let Some(when) = DateTime::from_timestamp(ts, 0) {
                return Some(when);
            }
        }
    }

    if let Some(error_obj) = error_obj {
        if let Some(secs) = error_obj.get("retry_after").and_then(Value::as_i64) {
            return Some(now + ChronoDuration::seconds(secs.max(0)));
        }
        if let Some(at) = error_obj
            .get("reset_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            return Some(at.with_timezone(&Utc));
        }
    }

    None
}

fn chrono_duration(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::seconds(60))
}
