use anyhow::Context;
use brennon_core::adapter::StandaloneAdapter;
use brennon_core::relay::LocalHub;
use brennon_core::{Brennon, create_app};
use brennon_db::Database;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing for structured logging
    #[cfg(debug_assertions)]
    let log_level = tracing::Level::DEBUG;
    #[cfg(not(debug_assertions))]
    let log_level = tracing::Level::INFO;

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();
    tracing::info!("Starting Brennon node...");

    let config = brennon_core::config::Config::from_env();
    tracing::info!(
        "Configuration: server={} group={} port={}, db_path={}, body_limit={}KB, timeout={}s",
        config.server_name,
        config.server_group,
        config.port,
        config.database_path,
        config.request_body_limit / 1024,
        config.request_timeout.as_secs(),
    );
    tracing::info!(
        "Rate limits: query={}/sec (burst {}), admin={}/sec (burst {})",
        config.rate_limit_query_per_sec,
        config.rate_limit_query_burst,
        config.rate_limit_admin_per_sec,
        config.rate_limit_admin_burst
    );
    if config.api_key.is_none() {
        tracing::warn!("BRENNON_API_KEY is unset, mutation routes will refuse every request");
    }

    let db = Database::open(&config.database_path)
        .await
        .with_context(|| format!("opening database at {}", config.database_path))?;

    // Single process: the in-memory hub stands in for the broker
    let hub = LocalHub::default();
    let port = config.port;
    let brennon = Brennon::start(
        config,
        db,
        Arc::new(hub.transport()),
        Arc::new(StandaloneAdapter),
    )
    .await
    .context("starting coordination core")?;

    let app = create_app(brennon.clone()).context("building router")?;
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Server listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await;

    brennon.shutdown().await;
    served.context("axum server error")
}
