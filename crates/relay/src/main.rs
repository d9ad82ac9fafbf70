use std::{sync::Arc, time::Duration};

use anyhow::Context;
use draftsync_relay::{
    auth::jwt::JwtAccessTokenService,
    build_router,
    config::{LogFormat, RelayConfig},
    cors,
    db::{migrations::run_migrations, pool},
    presence::PresenceHub,
    store::DocumentStore,
    sync::{
        clock::SystemClock, service::SyncService, snapshot::SnapshotPolicyEngine,
        ttl_store::MemoryTtlStore,
    },
};
use tokio::{net::TcpListener, signal, time::Instant};
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

const MAINTENANCE_EVERY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    install_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("DRAFTSYNC_RELAY_JWT_SECRET is unset; falling back to the development secret");
    }
    let tokens = JwtAccessTokenService::new(&config.jwt_secret)
        .context("DRAFTSYNC_RELAY_JWT_SECRET is unusable")?;

    let store = open_store(config.database_url.as_deref()).await?;
    let clock = Arc::new(SystemClock);
    let last_snapshot = Arc::new(MemoryTtlStore::new(config.snapshot.clock_ttl, clock.clone()));
    let sync = SyncService::new(
        store,
        SnapshotPolicyEngine::new(config.snapshot.into(), last_snapshot.clone(), clock),
        PresenceHub::new(),
        config.versions_per_page,
    );
    tokio::spawn(
        maintenance(last_snapshot, sync.clone()).instrument(info_span!("relay.maintenance")),
    );

    let app = build_router(Arc::new(tokens), sync, cors::cors_layer(config.cors_origins.as_deref()));
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("cannot listen on {}", config.listen_addr))?;

    info!(
        addr = %config.listen_addr,
        snapshot_updates = config.snapshot.update_threshold,
        snapshot_secs = config.snapshot.interval.as_secs(),
        "relay listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_requested())
        .await
        .context("relay server stopped with an error")
}

fn install_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if config.log_format == LogFormat::Json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// PostgreSQL when a URL is configured, otherwise a process-local store.
async fn open_store(database_url: Option<&str>) -> anyhow::Result<DocumentStore> {
    let Some(url) = database_url else {
        warn!("DRAFTSYNC_RELAY_DATABASE_URL is unset; documents live in memory only");
        return Ok(DocumentStore::memory());
    };

    let pg = pool::connect_pool(url, &pool::PoolConfig::from_env()).await?;
    pool::ping(&pg).await?;
    run_migrations(&pg).await?;
    info!("PostgreSQL store ready");
    Ok(DocumentStore::Postgres(pg))
}

/// Forgets stale snapshot timestamps and releases locks of idle documents.
async fn maintenance(last_snapshot: Arc<MemoryTtlStore>, sync: SyncService) {
    let mut ticker = tokio::time::interval_at(Instant::now() + MAINTENANCE_EVERY, MAINTENANCE_EVERY);
    loop {
        ticker.tick().await;
        let evicted = last_snapshot.evict_expired().await;
        let released = sync.locks().prune_idle().await;
        if evicted + released > 0 {
            info!(evicted, released, "maintenance pass");
        }
    }
}

async fn shutdown_requested() {
    let interrupt = async {
        if let Err(error) = signal::ctrl_c().await {
            error!(%error, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                error!(%error, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
    info!("draining connections before exit");
}
