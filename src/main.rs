use mimalloc::MiMalloc;
use std::net::SocketAddr;
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The server binary requires a real config file with a non-empty
    // gateway_key. (Library code uses `config::CONFIG` which is best-effort
    // and does not validate.)
    let cfg = sirius::config::Config::from_toml();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.clone()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        level = %cfg.logging.level,
        sampling_initial = cfg.logging.sampling_initial,
        sampling_thereafter = cfg.logging.sampling_thereafter,
        retention_days = cfg.logging.retention_days,
        "logging config loaded"
    );
    info!(
        load_batch_enabled = cfg.scheduling.load_batch_enabled,
        sticky_session_max_waiting = cfg.scheduling.sticky_session_max_waiting,
        retry_budget = cfg.upstream.retry_budget,
        request_timeout_secs = cfg.upstream.request_timeout_secs,
        session_ttl_secs = cfg.session.ttl_secs,
        digest_ttl_secs = cfg.session.digest_ttl_secs,
        idempotency_cleanup_interval_secs = cfg.idempotency.cleanup_interval_secs,
        idempotency_cleanup_batch = cfg.idempotency.cleanup_batch,
        dashboard_refresh_ttl_secs = cfg.dashboard.refresh_ttl_secs,
        dashboard_cache_ttl_secs = cfg.dashboard.cache_ttl_secs,
        "scheduler config loaded"
    );

    let db = sirius::db::spawn(cfg.basic.database_url.as_str()).await;
    let store = sirius::accounts::store::spawn(db).await;

    let addr = SocketAddr::from((cfg.basic.listen_addr, cfg.basic.listen_port));
    let state = sirius::server::router::GatewayState::new(cfg, store);
    let app = sirius::server::router::gateway_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server has shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { /* ... */ },
        _ = terminate => { /* ... */ },
    }
}
