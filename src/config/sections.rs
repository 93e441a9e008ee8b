use serde::{Deserialize, Serialize};
use url::Url;

/// Scheduler knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulingConfig {
    /// Query per-account load in one batch and rank by load rate. When the
    /// batch query fails the scheduler falls back to the priority-only path.
    /// TOML: `scheduling.load_batch_enabled`. Default: `true`.
    #[serde(default = "default_true")]
    pub load_batch_enabled: bool,

    /// Cap on parallel waiters behind one account before a request is turned
    /// away instead of queued.
    /// TOML: `scheduling.sticky_session_max_waiting`. Default: `3`.
    #[serde(default = "default_max_waiting")]
    pub sticky_session_max_waiting: u32,

    /// Detect Claude-Code requests (user agent / system preamble) for
    /// `claude_code_only` group gating.
    /// TOML: `scheduling.claude_code_detection`. Default: `true`.
    #[serde(default = "default_true")]
    pub claude_code_detection: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            load_batch_enabled: true,
            sticky_session_max_waiting: default_max_waiting(),
            claude_code_detection: true,
        }
    }
}

/// Session cache TTLs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Sticky binding TTL in seconds. TOML: `session.ttl_secs`. Default: `3600`.
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Gemini digest-chain TTL in seconds.
    /// TOML: `session.digest_ttl_secs`. Default: `300`.
    #[serde(default = "default_digest_ttl")]
    pub digest_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            digest_ttl_secs: default_digest_ttl(),
        }
    }
}

/// Concurrency limiter knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimiterConfig {
    /// Slot record expiry; a crashed process cannot hold a slot longer.
    /// TOML: `limiter.slot_ttl_secs`. Default: `600`.
    #[serde(default = "default_slot_ttl")]
    pub slot_ttl_secs: u64,

    /// Max in-flight requests per end user; `0` disables the user limiter.
    /// TOML: `limiter.user_max`. Default: `0`.
    #[serde(default)]
    pub user_max: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            slot_ttl_secs: default_slot_ttl(),
            user_max: 0,
        }
    }
}

/// Upstream HTTP behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Per-request upstream timeout in seconds.
    /// TOML: `upstream.request_timeout_secs`. Default: `600`.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Scheduler-level failover budget per client request (capped by the
    /// candidate set size). TOML: `upstream.retry_budget`. Default: `3`.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: usize,

    /// Cool-down applied on 529/overloaded signals, seconds.
    /// TOML: `upstream.overload_backoff_secs`. Default: `60`.
    #[serde(default = "default_overload_backoff")]
    pub overload_backoff_secs: u64,

    /// Cool-down applied on Cloudflare challenges, seconds.
    /// TOML: `upstream.cloudflare_cooldown_secs`. Default: `300`.
    #[serde(default = "default_cf_cooldown")]
    pub cloudflare_cooldown_secs: u64,

    /// Optional upstream HTTPS proxy for all outbound clients.
    /// TOML: `upstream.proxy`. Example: `http://127.0.0.1:1080`.
    #[serde(default)]
    pub proxy: Option<Url>,

    /// Allow HTTP/2 multiplexing for reqwest clients; disabled forces HTTP/1.
    /// TOML: `upstream.enable_multiplexing`. Default: `false`.
    #[serde(default)]
    pub enable_multiplexing: bool,

    /// Extra hosts allowed for account-provided `base_url` overrides, on top
    /// of the built-in provider hosts. TOML: `upstream.allowed_base_hosts`.
    #[serde(default)]
    pub allowed_base_hosts: Vec<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            retry_budget: default_retry_budget(),
            overload_backoff_secs: default_overload_backoff(),
            cloudflare_cooldown_secs: default_cf_cooldown(),
            proxy: None,
            enable_multiplexing: false,
            allowed_base_hosts: Vec::new(),
        }
    }
}

/// Dashboard ancillary caches. Aggregation itself lives outside this
/// service; the keys ride along in the shared config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DashboardConfig {
    /// TOML: `dashboard.refresh_ttl_secs`. Default: `30`.
    #[serde(default = "default_dash_refresh")]
    pub refresh_ttl_secs: u64,

    /// TOML: `dashboard.cache_ttl_secs`. Default: `60`.
    #[serde(default = "default_dash_cache")]
    pub cache_ttl_secs: u64,

    /// TOML: `dashboard.refresh_timeout_secs`. Default: `10`.
    #[serde(default = "default_dash_timeout")]
    pub refresh_timeout_secs: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            refresh_ttl_secs: default_dash_refresh(),
            cache_ttl_secs: default_dash_cache(),
            refresh_timeout_secs: default_dash_timeout(),
        }
    }
}

/// Knobs consumed by the idempotency coordinator (opaque collaborator).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdempotencyConfig {
    /// TOML: `idempotency.cleanup_interval_secs`. Default: `300`.
    #[serde(default = "default_idem_interval")]
    pub cleanup_interval_secs: u64,

    /// TOML: `idempotency.cleanup_batch`. Default: `100`.
    #[serde(default = "default_idem_batch")]
    pub cleanup_batch: u32,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_idem_interval(),
            cleanup_batch: default_idem_batch(),
        }
    }
}

/// Sora-only knobs. The media pipeline itself lives outside this service;
/// the gateway only consumes the cooldown and signing settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SoraConfig {
    /// TOML: `sora.poll_interval_secs`. Default: `2`.
    #[serde(default = "default_sora_poll")]
    pub poll_interval_secs: u64,

    /// TOML: `sora.max_poll_attempts`. Default: `60`.
    #[serde(default = "default_sora_attempts")]
    pub max_poll_attempts: u32,

    /// Per-account test cooldown window, seconds.
    /// TOML: `sora.test_cooldown_secs`. Default: `10`.
    #[serde(default = "default_sora_cooldown")]
    pub test_cooldown_secs: u64,

    /// Key used to sign generated media URLs. TOML: `sora.media_signing_key`.
    #[serde(default)]
    pub media_signing_key: String,

    /// TOML: `sora.media_url_ttl_secs`. Default: `600`.
    #[serde(default = "default_media_ttl")]
    pub media_url_ttl_secs: u64,
}

impl Default for SoraConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_sora_poll(),
            max_poll_attempts: default_sora_attempts(),
            test_cooldown_secs: default_sora_cooldown(),
            media_signing_key: String::new(),
            media_url_ttl_secs: default_media_ttl(),
        }
    }
}

/// Logging configuration. Only `level` drives the tracing subscriber; the
/// sampling/retention knobs are operator-facing and surfaced at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// TOML: `logging.level`. Default: `info`. `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// TOML: `logging.sampling_initial`. Default: `100`.
    #[serde(default = "default_sampling")]
    pub sampling_initial: u32,

    /// TOML: `logging.sampling_thereafter`. Default: `100`.
    #[serde(default = "default_sampling")]
    pub sampling_thereafter: u32,

    /// Annotate records with the call site. TOML: `logging.caller`.
    /// Default: `false`.
    #[serde(default)]
    pub caller: bool,

    /// Minimum level that captures a stack trace.
    /// TOML: `logging.stacktrace_level`. Default: `error`.
    #[serde(default = "default_stacktrace_level")]
    pub stacktrace_level: String,

    /// TOML: `logging.retention_days`. Default: `7`.
    #[serde(default = "default_retention")]
    pub retention_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            sampling_initial: default_sampling(),
            sampling_thereafter: default_sampling(),
            caller: false,
            stacktrace_level: default_stacktrace_level(),
            retention_days: default_retention(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_waiting() -> u32 {
    3
}
fn default_session_ttl() -> u64 {
    3600
}
fn default_digest_ttl() -> u64 {
    300
}
fn default_slot_ttl() -> u64 {
    600
}
fn default_request_timeout() -> u64 {
    600
}
fn default_retry_budget() -> usize {
    3
}
fn default_overload_backoff() -> u64 {
    60
}
fn default_cf_cooldown() -> u64 {
    300
}
fn default_dash_refresh() -> u64 {
    30
}
fn default_dash_cache() -> u64 {
    60
}
fn default_dash_timeout() -> u64 {
    10
}
fn default_idem_interval() -> u64 {
    300
}
fn default_stacktrace_level() -> String {
    "error".to_string()
}
fn default_idem_batch() -> u32 {
    100
}
fn default_sora_poll() -> u64 {
    2
}
fn default_sora_attempts() -> u32 {
    60
}
fn default_sora_cooldown() -> u64 {
    10
}
fn default_media_ttl() -> u64 {
    600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_sampling() -> u32 {
    100
}
fn default_retention() -> u32 {
    7
}
