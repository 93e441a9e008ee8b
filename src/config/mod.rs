mod basic;
mod sections;

pub use basic::BasicConfig;
pub use sections::{
    DashboardConfig, IdempotencyConfig, LimiterConfig, LoggingConfig, SchedulingConfig,
    SessionConfig, SoraConfig, UpstreamConfig,
};

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::LazyLock};

/// Application configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Core server configuration (see `basic` table in config.toml).
    #[serde(default)]
    pub basic: BasicConfig,

    /// Account scheduler settings.
    #[serde(default)]
    pub scheduling: SchedulingConfig,

    /// Sticky session / digest chain TTLs.
    #[serde(default)]
    pub session: SessionConfig,

    /// Concurrency limiter settings.
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Upstream HTTP settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Dashboard ancillary cache settings.
    #[serde(default)]
    pub dashboard: DashboardConfig,

    /// Idempotency coordinator settings (opaque collaborator).
    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    /// Sora-only settings.
    #[serde(default)]
    pub sora: SoraConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";

impl Config {
    /// Builds a Figment that merges defaults and a config TOML file.
    pub fn figment() -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            figment.merge(Toml::file(DEFAULT_CONFIG_FILE))
        } else {
            figment
        }
    }

    /// Loads configuration by merging defaults and `config.toml` if present.
    ///
    /// Note: this does **not** validate required fields like
    /// `basic.gateway_key`. Binaries should call `Config::from_toml()`
    /// instead to avoid running with insecure defaults.
    pub fn from_optional_toml() -> Self {
        Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration (defaults + optional config.toml): {err}")
        })
    }

    /// Loads configuration from the TOML file (with defaults) and validates
    /// required fields.
    pub fn from_toml() -> Self {
        if !PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            panic!("config file not found: {}", DEFAULT_CONFIG_FILE);
        }
        let cfg: Self = Self::figment().extract().unwrap_or_else(|err| {
            panic!(
                "failed to extract configuration from {}: {err}",
                DEFAULT_CONFIG_FILE
            )
        });
        if cfg.basic.gateway_key.trim().is_empty() {
            panic!("basic.gateway_key must be set and non-empty");
        }
        cfg
    }
}

/// Global, lazily-initialized configuration instance.
pub static CONFIG: LazyLock<Config> = LazyLock::new(Config::from_optional_toml);
