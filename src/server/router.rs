use crate::accounts::{AccountStoreHandle, TestCooldown};
use crate::config::Config;
use crate::limiter::ConcurrencyLimiter;
use crate::ratelimit::{StatusMachine, TokenCache};
use crate::scheduler::Scheduler;
use crate::server::guards::auth::RequireKeyAuth;
use crate::server::routes::{admin, gemini, messages, responses};
use crate::session::SessionService;

use axum::{
    Router,
    extract::Request,
    http::{HeaderName, StatusCode, header::USER_AGENT},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use base64::Engine as _;
use rand::RngCore;
use reqwest::header::{CONNECTION, HeaderMap, HeaderValue};
use std::time::{Duration, Instant};
use std::sync::Arc;
use tracing::{error, info, warn};

const GATEWAY_USER_AGENT: &str = concat!("sirius/", env!("CARGO_PKG_VERSION"));
const MAX_REQUEST_ID_LEN: usize = 128;
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Fresh id for requests that arrive without one. Doubles as the slot
/// holder key in the concurrency limiter, so it must be unique per request.
pub(crate) fn new_request_id() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill_bytes(&mut raw);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

#[derive(Clone)]
pub struct GatewayState {
    pub store: AccountStoreHandle,
    pub scheduler: Arc<Scheduler>,
    pub machine: Arc<StatusMachine>,
    pub sessions: Arc<SessionService>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub client: reqwest::Client,
    pub cfg: Arc<Config>,
    pub gateway_key: Arc<str>,
    pub test_cooldown: Arc<TestCooldown>,
}

impl GatewayState {
    pub fn new(cfg: Config, store: AccountStoreHandle) -> Self {
        let cfg = Arc::new(cfg);
        let sessions = Arc::new(SessionService::new(&cfg.session));
        let limiter = Arc::new(ConcurrencyLimiter::new(&cfg.limiter));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            sessions.clone(),
            limiter.clone(),
            cfg.scheduling.clone(),
        ));
        let tokens = Arc::new(TokenCache::new());
        let machine = Arc::new(StatusMachine::new(store.clone(), tokens, &cfg.upstream));

        let client = build_client(&cfg);
        let gateway_key: Arc<str> = Arc::from(cfg.basic.gateway_key.as_str());
        let test_cooldown = Arc::new(TestCooldown::new(Duration::from_secs(
            cfg.sora.test_cooldown_secs,
        )));

        Self {
            store,
            scheduler,
            machine,
            sessions,
            limiter,
            client,
            cfg,
            gateway_key,
            test_cooldown,
        }
    }
}

fn build_client(cfg: &Config) -> reqwest::Client {
    let mut headers = HeaderMap::new();

    let mut builder = reqwest::Client::builder()
        .user_agent(GATEWAY_USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(cfg.upstream.request_timeout_secs));

    if let Some(proxy_url) = &cfg.upstream.proxy {
        let proxy = reqwest::Proxy::all(proxy_url.as_str())
            .expect("invalid proxy url for reqwest client");
        builder = builder.proxy(proxy);
    }

    if cfg.upstream.enable_multiplexing {
        builder = builder.http2_adaptive_window(true);
    } else {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        builder = builder
            .http1_only()
            .pool_max_idle_per_host(0)
            .pool_idle_timeout(Duration::from_secs(0));
    }

    builder
        .default_headers(headers)
        .build()
        .expect("failed to build reqwest client")
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn access_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let proto = req.version();

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(new_request_id);

    let agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let started = Instant::now();
    let mut resp = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(X_REQUEST_ID, value);
    }

    let status = resp.status();
    // Relay responses stream; this measures time to first byte, not the
    // whole conversation.
    let ttfb_ms = started.elapsed().as_millis() as u64;

    if status.is_server_error() {
        error!(
            status = status.as_u16(),
            request_id = %request_id,
            method = %method,
            proto = ?proto,
            path = %path,
            ttfb_ms,
            agent = %agent,
            "request served"
        );
    } else if status.is_client_error() {
        warn!(
            status = status.as_u16(),
            request_id = %request_id,
            method = %method,
            proto = ?proto,
            path = %path,
            ttfb_ms,
            agent = %agent,
            "request served"
        );
    } else {
        info!(
            status = status.as_u16(),
            request_id = %request_id,
            method = %method,
            proto = ?proto,
            path = %path,
            ttfb_ms,
            agent = %agent,
            "request served"
        );
    }

    resp
}

pub fn gateway_router(state: GatewayState) -> Router {
    let relay_routes = Router::new()
        .route("/v1/messages", post(messages::messages_handler))
        .route("/responses", post(responses::responses_handler))
        .route("/v1beta/models/{*model_call}", post(gemini::generate_handler))
        .route("/accounts/{id}/test", post(admin::account_test_handler))
        .layer(middleware::from_extractor_with_state::<RequireKeyAuth, _>(
            state.clone(),
        ));

    Router::new()
        .route("/healthz", get(healthz_handler))
        .merge(relay_routes)
        .fallback(not_found_handler)
        .with_state(state)
        .layer(middleware::from_fn(access_log))
}
