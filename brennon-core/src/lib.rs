pub mod adapter;
pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod helpers;
pub mod punishments;
pub mod ranks;
pub mod relay;
mod routes;
pub mod topology;
pub mod validation;

use adapter::PlatformAdapter;
use axum::{
    Router,
    http::StatusCode,
    routing::{get, post, put},
};
use brennon_db::Database;
use bus::EventBus;
use cache::PresenceCache;
use config::Config;
use error::{BrennonError, Result};
use punishments::PunishmentEngine;
use ranks::RankResolver;
use relay::{MessagingRelay, Transport};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use topology::{LocalServer, ServerTopology};
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info, warn};

/// One process's coordination core, wired once at startup and shared by handle.
pub struct Brennon {
    pub config: Config,
    pub db: Database,
    pub bus: Arc<EventBus>,
    pub relay: Arc<MessagingRelay>,
    pub ranks: Arc<RankResolver>,
    pub presence: Arc<PresenceCache>,
    pub punishments: Arc<PunishmentEngine>,
    pub topology: Arc<ServerTopology>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Brennon {
    /// Build every component, load ranks and topology, and start the
    /// background tasks. A broken rank graph aborts startup.
    pub async fn start(
        config: Config,
        db: Database,
        transport: Arc<dyn Transport>,
        adapter: Arc<dyn PlatformAdapter>,
    ) -> Result<Arc<Self>> {
        let bus = Arc::new(EventBus::new());
        let relay = Arc::new(MessagingRelay::new(
            config.origin_id.clone(),
            transport,
            bus.clone(),
            config.transport_timeout,
        ));

        let ranks = Arc::new(RankResolver::load(db.clone(), bus.clone(), relay.clone(), config.store_timeout).await?);
        let presence = Arc::new(PresenceCache::new(
            db.clone(),
            bus.clone(),
            relay.clone(),
            ranks.clone(),
            config.store_timeout,
            config.staleness_threshold,
            config.presence_retention,
        ));
        let punishments = Arc::new(PunishmentEngine::new(
            db.clone(),
            bus.clone(),
            relay.clone(),
            presence.clone(),
            adapter.clone(),
            config.store_timeout,
        ));
        let topology = Arc::new(ServerTopology::new(
            db.clone(),
            bus.clone(),
            relay.clone(),
            presence.clone(),
            adapter.clone(),
            LocalServer {
                name: config.server_name.clone(),
                group: config.server_group.clone(),
                host: config.server_host.clone(),
                port: config.server_port,
                max_players: config.local_max_players,
                motd: config.motd.clone(),
            },
            config.default_group.clone(),
            config.heartbeat_timeout,
            config.store_timeout,
        ));

        // Resolver first: cache handlers need the updated graph
        ranks.attach();
        presence.attach();
        punishments.attach();
        topology.attach();

        topology.load().await?;

        let brennon = Arc::new(Self {
            config,
            db,
            bus,
            relay,
            ranks,
            presence,
            punishments,
            topology,
            tasks: Mutex::new(Vec::new()),
        });

        let tasks = vec![
            brennon.relay.spawn_inbound(),
            brennon
                .relay
                .spawn_health_check(brennon.config.heartbeat_interval.min(Duration::from_secs(5))),
            spawn_heartbeat(&brennon),
            spawn_sweep(&brennon),
        ];
        *brennon.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;

        if let Err(err) = brennon
            .topology
            .report_local_status(true, helpers::now())
            .await
        {
            warn!(error = %err, "initial heartbeat failed");
        }

        info!(
            server = %brennon.config.server_name,
            origin = %brennon.relay.origin_id(),
            adapter = adapter.name(),
            "brennon started"
        );
        Ok(brennon)
    }

    /// Stop background tasks, announce this server offline, drop all handlers.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }

        if let Err(err) = self
            .topology
            .report_local_status(false, helpers::now())
            .await
        {
            warn!(error = %err, "offline heartbeat failed");
        }

        self.bus.clear();
        info!(server = %self.config.server_name, "brennon stopped");
    }
}

fn spawn_heartbeat(brennon: &Arc<Brennon>) -> JoinHandle<()> {
    let interval = brennon.config.heartbeat_interval;
    let brennon: Weak<Brennon> = Arc::downgrade(brennon);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            let Some(brennon) = brennon.upgrade() else {
                break;
            };
            if let Err(err) = brennon
                .topology
                .report_local_status(true, helpers::now())
                .await
            {
                warn!(error = %err, "heartbeat failed");
            }
        }
    })
}

fn spawn_sweep(brennon: &Arc<Brennon>) -> JoinHandle<()> {
    let interval = brennon.config.sweep_interval;
    let brennon: Weak<Brennon> = Arc::downgrade(brennon);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            let Some(brennon) = brennon.upgrade() else {
                break;
            };
            let stats = brennon.presence.sweep(helpers::now());
            debug!(?stats, "sweep finished");
        }
    })
}

/// Milliseconds per replenished request for a requests-per-second budget.
fn replenish_millis(per_sec: u64) -> u64 {
    (1000 / per_sec.max(1)).max(1)
}

pub struct AppState {
    pub brennon: Arc<Brennon>,
    /// SHA-256 of the configured API key
    pub api_key_hash: Option<String>,
}

/// Create the HTTP router for a running core
pub fn create_app(brennon: Arc<Brennon>) -> Result<Router> {
    let config = brennon.config.clone();
    let state = Arc::new(AppState {
        api_key_hash: config.api_key.as_deref().map(helpers::hash_api_key),
        brennon,
    });

    // Lenient rate limit for lookups - consulted by every server
    let query_governor = GovernorConfigBuilder::default()
        .per_millisecond(replenish_millis(config.rate_limit_query_per_sec))
        .burst_size(config.rate_limit_query_burst)
        .key_extractor(GlobalKeyExtractor)
        .finish()
        .ok_or_else(|| BrennonError::Configuration("invalid query rate limit".into()))?;

    // Stricter rate limit for moderation and routing actions
    let admin_governor = GovernorConfigBuilder::default()
        .per_millisecond(replenish_millis(config.rate_limit_admin_per_sec))
        .burst_size(config.rate_limit_admin_burst)
        .key_extractor(GlobalKeyExtractor)
        .finish()
        .ok_or_else(|| BrennonError::Configuration("invalid admin rate limit".into()))?;

    let query_routes = Router::new()
        .route("/status", get(routes::status))
        .route("/players", get(routes::online_players))
        .route("/names/{name}", get(routes::player_by_name))
        .route("/players/{uuid}", get(routes::player))
        .route("/players/{uuid}/permissions/{node}", get(routes::permission))
        .route("/players/{uuid}/punishments", get(routes::active_punishments))
        .route("/players/{uuid}/history", get(routes::history))
        .route("/ranks", get(routes::ranks))
        .route("/servers", get(routes::servers))
        .route("/groups", get(routes::groups))
        .layer(GovernorLayer::new(query_governor));

    let admin_routes = Router::new()
        .route("/sessions/join", post(routes::session_join))
        .route("/sessions/quit", post(routes::session_quit))
        .route("/punishments", post(routes::issue_punishment))
        .route("/punishments/{id}/revoke", post(routes::revoke_punishment))
        .route("/players/{uuid}/unban", post(routes::unban))
        .route("/players/{uuid}/unmute", post(routes::unmute))
        .route("/players/{uuid}/ranks", post(routes::change_ranks))
        .route("/players/{uuid}/permissions", post(routes::change_permissions))
        .route("/players/{uuid}/send", post(routes::send_player))
        .route("/ranks/{id}", put(routes::save_rank).delete(routes::delete_rank))
        .route("/groups/{id}", put(routes::save_group).delete(routes::delete_group))
        .route(
            "/servers/{name}",
            put(routes::register_server).delete(routes::unregister_server),
        )
        .layer(GovernorLayer::new(admin_governor));

    Ok(Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .merge(query_routes)
        .merge(admin_routes)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(RequestBodyLimitLayer::new(config.request_body_limit))
        .with_state(state))
}
