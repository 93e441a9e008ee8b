use crate::accounts::{Account, AccountKind, Platform};
use crate::error::GatewayError;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use std::net::IpAddr;
use url::Url;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_OAUTH_BETA: &str = "oauth-2025-04-20";
const ANTIGRAVITY_USER_AGENT: &str = "antigravity/1.16.5 linux/amd64";

/// Hosts always acceptable for account-provided `base_url` overrides.
const BUILTIN_BASE_HOSTS: &[&str] = &[
    "api.anthropic.com",
    "api.openai.com",
    "chatgpt.com",
    "generativelanguage.googleapis.com",
    "cloudcode-pa.googleapis.com",
    "daily-cloudcode-pa.googleapis.com",
];

fn build_provider_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    url.set_path(path);
    url.set_query(query);
    url
}

#[derive(Debug, Clone)]
pub(crate) struct ProviderEndpoints {
    stream: Url,
    no_stream: Url,
}

impl ProviderEndpoints {
    pub(crate) fn new(
        base: Url,
        stream_path: &str,
        stream_query: Option<&str>,
        no_stream_path: &str,
        no_stream_query: Option<&str>,
    ) -> Self {
        Self {
            stream: build_provider_url(&base, stream_path, stream_query),
            no_stream: build_provider_url(&base, no_stream_path, no_stream_query),
        }
    }

    pub(crate) fn select(&self, stream: bool) -> &Url {
        if stream {
            &self.stream
        } else {
            &self.no_stream
        }
    }
}

fn default_base(url: &str) -> Url {
    Url::parse(url).expect("invalid fixed provider base URL")
}

/// Enforce HTTPS, host allow-listing and private-IP rejection on an
/// account-provided base URL.
pub fn validate_base_url(url: &Url, extra_allowed_hosts: &[String]) -> Result<(), GatewayError> {
    if url.scheme() != "https" {
        return Err(GatewayError::InvalidBaseUrl(format!(
            "scheme `{}` is not https",
            url.scheme()
        )));
    }

    let Some(host) = url.host_str() else {
        return Err(GatewayError::InvalidBaseUrl("missing host".to_string()));
    };

    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        let private = match ip {
            IpAddr::V4(v4) => {
                v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
            }
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || v6.is_unique_local(),
        };
        if private {
            return Err(GatewayError::InvalidBaseUrl(format!(
                "private or loopback address {host} rejected"
            )));
        }
    }

    let allowed = BUILTIN_BASE_HOSTS.iter().any(|h| *h == host)
        || extra_allowed_hosts.iter().any(|h| h == host);
    if !allowed {
        return Err(GatewayError::InvalidBaseUrl(format!(
            "host {host} not in the allow-list"
        )));
    }

    Ok(())
}

/// Upstream endpoint pair for one (platform, account, model) combination.
/// The account's validated `base_url` replaces the default host.
pub(crate) fn endpoints_for(
    account: &Account,
    model: &str,
    extra_allowed_hosts: &[String],
) -> Result<ProviderEndpoints, GatewayError> {
    let base_override = match account.base_url() {
        Some(raw) => {
            let url = Url::parse(raw)
                .map_err(|e| GatewayError::InvalidBaseUrl(format!("{raw}: {e}")))?;
            validate_base_url(&url, extra_allowed_hosts)?;
            Some(url)
        }
        None => None,
    };

    let endpoints = match account.platform {
        Platform::Anthropic => {
            let base = base_override.unwrap_or_else(|| default_base("https://api.anthropic.com"));
            ProviderEndpoints::new(base, "/v1/messages", None, "/v1/messages", None)
        }

        Platform::Openai => match account.kind {
            // ChatGPT OAuth traffic goes through the Codex backend.
            AccountKind::Oauth | AccountKind::SetupToken => {
                let base = base_override.unwrap_or_else(|| default_base("https://chatgpt.com"));
                ProviderEndpoints::new(
                    base,
                    "/backend-api/codex/responses",
                    None,
                    "/backend-api/codex/responses",
                    None,
                )
            }
            AccountKind::ApiKey => {
                let base = base_override.unwrap_or_else(|| default_base("https://api.openai.com"));
                ProviderEndpoints::new(base, "/v1/responses", None, "/v1/responses", None)
            }
        },

        Platform::Gemini => match account.kind {
            // OAuth accounts talk to Gemini Code Assist; the body is wrapped
            // as {model, project, request}.
            AccountKind::Oauth | AccountKind::SetupToken => {
                let base = base_override
                    .unwrap_or_else(|| default_base("https://cloudcode-pa.googleapis.com"));
                ProviderEndpoints::new(
                    base,
                    "/v1internal:streamGenerateContent",
                    Some("alt=sse"),
                    "/v1internal:generateContent",
                    None,
                )
            }
            AccountKind::ApiKey => {
                let base = base_override
                    .unwrap_or_else(|| default_base("https://generativelanguage.googleapis.com"));
                ProviderEndpoints::new(
                    base,
                    &format!("/v1beta/models/{model}:streamGenerateContent"),
                    Some("alt=sse"),
                    &format!("/v1beta/models/{model}:generateContent"),
                    None,
                )
            }
        },

        Platform::Antigravity => {
            let base = base_override
                .unwrap_or_else(|| default_base("https://daily-cloudcode-pa.googleapis.com"));
            ProviderEndpoints::new(
                base,
                "/v1internal:streamGenerateContent",
                Some("alt=sse"),
                "/v1internal:generateContent",
                None,
            )
        }

        Platform::Sora => {
            // Media generation runs in its own pipeline; the chat relay has
            // no Sora endpoint.
            return Err(GatewayError::InvalidRequest(
                "sora accounts are not served by the chat relay".to_string(),
            ));
        }
    };

    Ok(endpoints)
}

/// Platform-appropriate auth and protocol headers.
pub(crate) fn build_headers(
    account: &Account,
    token: &str,
    thinking_enabled: bool,
) -> Result<HeaderMap, GatewayError> {
    let mut headers = HeaderMap::new();
    let bearer = |headers: &mut HeaderMap| -> Result<(), GatewayError> {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| GatewayError::Internal(format!("invalid auth header: {e}")))?,
        );
        Ok(())
    };

    match account.platform {
        Platform::Anthropic => {
            headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
            let mut betas: Vec<&str> = Vec::new();
            match account.kind {
                AccountKind::Oauth | AccountKind::SetupToken => {
                    bearer(&mut headers)?;
                    betas.push(ANTHROPIC_OAUTH_BETA);
                }
                AccountKind::ApiKey => {
                    headers.insert(
                        "x-api-key",
                        HeaderValue::from_str(token).map_err(|e| {
                            GatewayError::Internal(format!("invalid api key header: {e}"))
                        })?,
                    );
                }
            }
            if thinking_enabled {
                betas.push("interleaved-thinking-2025-05-14");
            }
            if !betas.is_empty() {
                headers.insert(
                    "anthropic-beta",
                    HeaderValue::from_str(&betas.join(","))
                        .map_err(|e| GatewayError::Internal(format!("invalid beta header: {e}")))?,
                );
            }
        }

        Platform::Openai => {
            bearer(&mut headers)?;
            if let Some(project) = account.project_id() {
                headers.insert(
                    "chatgpt-account-id",
                    HeaderValue::from_str(project).map_err(|e| {
                        GatewayError::Internal(format!("invalid account header: {e}"))
                    })?,
                );
            }
        }

        Platform::Gemini => match account.kind {
            AccountKind::Oauth | AccountKind::SetupToken => bearer(&mut headers)?,
            AccountKind::ApiKey => {
                headers.insert(
                    "x-goog-api-key",
                    HeaderValue::from_str(token).map_err(|e| {
                        GatewayError::Internal(format!("invalid api key header: {e}"))
                    })?,
                );
            }
        },

        Platform::Antigravity => {
            bearer(&mut headers)?;
            headers.insert(USER_AGENT, HeaderValue::from_static(ANTIGRAVITY_USER_AGENT));
        }

        Platform::Sora => {
            return Err(GatewayError::InvalidRequest(
                "sora accounts are not served by the chat relay".to_string(),
            ));
        }
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStatus;
    use serde_json::{Map, json};

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
    fn anthropic_endpoints_use_messages_path() {
        let endpoints = endpoints_for(
            &account(Platform::Anthropic, AccountKind::ApiKey),
            "claude-3-5-sonnet-20241022",
            &[],
        )
        .unwrap();
        assert_eq!(
            endpoints.select(true).as_str(),
            "https://api.anthropic.com/v1/messages"
        );
    }

    #[test]
    fn gemini_apikey_endpoints_embed_model_and_sse_query() {
        let endpoints = endpoints_for(
            &account(Platform::Gemini, AccountKind::ApiKey),
            "gemini-2.5-pro",
            &[],
        )
        .unwrap();
        assert_eq!(
            endpoints.select(true).as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
        assert_eq!(
            endpoints.select(false).as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:generateContent"
        );
    }

    #[test]
    fn codex_oauth_uses_backend_api() {
        let endpoints = endpoints_for(
            &account(Platform::Openai, AccountKind::Oauth),
            "gpt-5.1",
            &[],
        )
        .unwrap();
        assert_eq!(
            endpoints.select(true).as_str(),
            "https://chatgpt.com/backend-api/codex/responses"
        );
    }

    #[test]
    fn base_url_must_be_https_and_allowlisted() {
        let http = Url::parse("http://api.anthropic.com").unwrap();
        assert!(validate_base_url(&http, &[]).is_err());

        let unknown = Url::parse("https://evil.example.com").unwrap();
        assert!(validate_base_url(&unknown, &[]).is_err());
        assert!(validate_base_url(&unknown, &["evil.example.com".to_string()]).is_ok());

        let private = Url::parse("https://10.0.0.8").unwrap();
        assert!(validate_base_url(&private, &["10.0.0.8".to_string()]).is_err());
        let loopback = Url::parse("https://127.0.0.1").unwrap();
        assert!(validate_base_url(&loopback, &[]).is_err());
    }

    #[test]
    fn base_url_override_replaces_host() {
        let mut acct = account(Platform::Anthropic, AccountKind::ApiKey);
        acct.credentials
            .insert("base_url".to_string(), json!("https://relay.example.com"));

        let err = endpoints_for(&acct, "m", &[]).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidBaseUrl(_)));

        let endpoints = endpoints_for(&acct, "m", &["relay.example.com".to_string()]).unwrap();
        assert_eq!(
            endpoints.select(false).as_str(),
            "https://relay.example.com/v1/messages"
        );
    }

    #[test]
    fn anthropic_oauth_headers_carry_bearer_and_beta() {
        let headers = build_headers(
            &account(Platform::Anthropic, AccountKind::Oauth),
            "tok",
            false,
        )
        .unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok");
        assert_eq!(headers.get("anthropic-beta").unwrap(), "oauth-2025-04-20");
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
    }

    #[test]
    fn anthropic_apikey_headers_use_x_api_key() {
        let headers = build_headers(
            &account(Platform::Anthropic, AccountKind::ApiKey),
            "sk-x",
            true,
        )
        .unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-x");
        assert!(headers.get(AUTHORIZATION).is_none());
        assert_eq!(
            headers.get("anthropic-beta").unwrap(),
            "interleaved-thinking-2025-05-14"
        );
    }
}
