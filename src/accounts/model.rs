use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Upstream provider family an account belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Anthropic,
    Openai,
    Gemini,
    Antigravity,
    Sora,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Anthropic => "anthropic",
            Platform::Openai => "openai",
            Platform::Gemini => "gemini",
            Platform::Antigravity => "antigravity",
            Platform::Sora => "sora",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anthropic" => Some(Platform::Anthropic),
            "openai" => Some(Platform::Openai),
            "gemini" => Some(Platform::Gemini),
            "antigravity" => Some(Platform::Antigravity),
            "sora" => Some(Platform::Sora),
            _ => None,
        }
    }

    /// Infer a platform from a requested model name. Used as the last resort
    /// after the forced platform and the group platform.
    pub fn from_model(model: &str) -> Option<Self> {
        if model.starts_with("claude") {
            return Some(Platform::Anthropic);
        }
        if model.starts_with("sora") {
            return Some(Platform::Sora);
        }
        if model.starts_with("gemini") {
            return Some(Platform::Gemini);
        }
        if model.starts_with("gpt")
            || model.starts_with("codex")
            || model
                .strip_prefix('o')
                .is_some_and(|rest| rest.chars().next().is_some_and(|c| c.is_ascii_digit()))
        {
            return Some(Platform::Openai);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Oauth,
    ApiKey,
    SetupToken,
}

impl AccountKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountKind::Oauth => "oauth",
            AccountKind::ApiKey => "apikey",
            AccountKind::SetupToken => "setup_token",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "oauth" => Some(AccountKind::Oauth),
            "apikey" => Some(AccountKind::ApiKey),
            "setup_token" => Some(AccountKind::SetupToken),
            _ => None,
        }
    }

    /// OAuth-family kinds keep a cached access token that must be dropped
    /// when upstream reports 401.
    pub fn caches_access_token(self) -> bool {
        matches!(self, AccountKind::Oauth | AccountKind::SetupToken)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Error,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Error => "error",
            AccountStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccountStatus::Active),
            "error" => Some(AccountStatus::Error),
            "disabled" => Some(AccountStatus::Disabled),
            _ => None,
        }
    }
}

/// In-memory projection of the persisted `credentials` map, discriminated by
/// the account kind. The map stays the source of truth; this view exists so
/// call sites cannot mix up token flavors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Oauth {
        access_token: Option<String>,
        refresh_token: String,
        expires_at: Option<DateTime<Utc>>,
    },
    ApiKey {
        api_key: String,
    },
    SetupToken {
        token: String,
    },
}

/// Per-account temp-unschedulable rule, configured under
/// `extra.temp_unschedulable_rules`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempUnschedulableRule {
    pub status: u16,
    pub keyword: String,
    pub duration_secs: u64,
    #[serde(default)]
    pub description: String,
}

/// Models the Antigravity upstream accepts. Requests outside this list never
/// schedule onto an Antigravity account, regardless of credentials.
pub const ANTIGRAVITY_MODELS: &[&str] = &[
    "claude-sonnet-4-5",
    "claude-sonnet-4-5-thinking",
    "claude-opus-4-5",
    "claude-opus-4-5-thinking",
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gemini-3-pro-preview",
];

#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub platform: Platform,
    pub kind: AccountKind,

    /// Smaller number = preferred.
    pub priority: i32,
    pub schedulable: bool,
    pub status: AccountStatus,
    pub error_message: Option<String>,
    /// Max in-flight slots.
    pub concurrency: u32,

    /// Persisted credential map (tokens, api_key, project_id, base_url,
    /// model_mapping). Mutations bump `credential_generation`.
    pub credentials: Map<String, Value>,
    pub credential_generation: u64,

    pub last_used_at: Option<DateTime<Utc>>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub overload_until: Option<DateTime<Utc>>,
    pub temp_unschedulable_until: Option<DateTime<Utc>>,
    /// Per-scope (model or quota key) rate-limit resets, independent of the
    /// account-wide timer.
    pub scoped_rate_limits: BTreeMap<String, DateTime<Utc>>,

    pub group_ids: Vec<i64>,
    /// Free-form policy toggles (`mixed_scheduling`,
    /// `temp_unschedulable_rules`, `disable_tls_fingerprint`, …).
    pub extra: Map<String, Value>,
}

impl Account {
    /// Project the persisted credentials map onto the typed sum.
    pub fn credential(&self) -> Option<Credential> {
        match self.kind {
            AccountKind::Oauth => Some(Credential::Oauth {
                access_token: self.cred_str("access_token").map(str::to_string),
                refresh_token: self.cred_str("refresh_token")?.to_string(),
                expires_at: self
                    .cred_str("expires_at")
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc)),
            }),
            AccountKind::ApiKey => Some(Credential::ApiKey {
                api_key: self.cred_str("api_key")?.to_string(),
            }),
            AccountKind::SetupToken => Some(Credential::SetupToken {
                token: self.cred_str("token")?.to_string(),
            }),
        }
    }

    fn cred_str(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).and_then(Value::as_str)
    }

    pub fn base_url(&self) -> Option<&str> {
        self.cred_str("base_url")
    }

    pub fn project_id(&self) -> Option<&str> {
        self.cred_str("project_id")
    }

    /// Optional requested-model → upstream-model mapping. An account with no
    /// mapping advertises every model of its platform.
    pub fn model_mapping(&self) -> Option<&Map<String, Value>> {
        self.credentials.get("model_mapping").and_then(Value::as_object)
    }

    /// Upstream model name to send for a requested model.
    pub fn upstream_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_mapping()
            .and_then(|m| m.get(requested))
            .and_then(Value::as_str)
            .unwrap_or(requested)
    }

    pub fn supports_model(&self, requested: &str) -> bool {
        if self.platform == Platform::Antigravity && !ANTIGRAVITY_MODELS.contains(&requested) {
            return false;
        }
        match self.model_mapping() {
            Some(mapping) => mapping.contains_key(requested),
            None => true,
        }
    }

    fn extra_bool(&self, key: &str) -> bool {
        match self.extra.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => false,
        }
    }

    /// Opt-in allowing an Antigravity account to serve Anthropic-platform
    /// requests.
    pub fn mixed_scheduling(&self) -> bool {
        self.extra_bool("mixed_scheduling")
    }

    pub fn disable_tls_fingerprint(&self) -> bool {
        self.extra_bool("disable_tls_fingerprint")
    }

    pub fn temp_unschedulable_rules(&self) -> Vec<TempUnschedulableRule> {
        self.extra
            .get("temp_unschedulable_rules")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Account-wide policy eligibility at `now`. Per-scope limits and
    /// concurrency headroom are checked separately by the scheduler.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.schedulable
            && self.status == AccountStatus::Active
            && self.rate_limit_reset_at.is_none_or(|t| now >= t)
            && self.overload_until.is_none_or(|t| now >= t)
            && self.temp_unschedulable_until.is_none_or(|t| now >= t)
    }

    /// True when the given scope (model or quota key) is under a live
    /// per-scope rate limit.
    pub fn is_scope_limited(&self, scope: &str, now: DateTime<Utc>) -> bool {
        self.scoped_rate_limits
            .get(scope)
            .is_some_and(|reset| now < *reset)
    }

    pub fn never_used(&self) -> bool {
        self.last_used_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Active,
    Disabled,
}

impl GroupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupStatus::Active => "active",
            GroupStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(GroupStatus::Active),
            "disabled" => Some(GroupStatus::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: i64,
    pub name: String,
    /// Empty for multi-platform groups.
    pub platform: Option<Platform>,
    pub status: GroupStatus,
    /// True once relational fields (`account_ids`) are loaded.
    pub hydrated: bool,
    pub claude_code_only: bool,
    pub fallback_group_id: Option<i64>,
    pub model_routing_enabled: bool,
    /// Requested model → ordered account id preference list.
    pub model_routing: HashMap<String, Vec<i64>>,
    pub account_ids: Vec<i64>,
}

impl Group {
    pub fn routed_accounts(&self, model: &str) -> Option<&Vec<i64>> {
        if !self.model_routing_enabled {
            return None;
        }
        self.model_routing.get(model).filter(|ids| !ids.is_empty())
    }
}
