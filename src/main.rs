use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cinema_booking::{
    cache::CacheService,
    clock::SystemClock,
    config::Config,
    database::Database,
    redis_client::RedisClient,
    router,
    services::{HubNotifier, NoopNotifier, Notifier},
    store::PgStore,
    AppState,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("failed to load configuration")?;

    let filter = tracing_subscriber::EnvFilter::new(&config.app.rust_log);
    if config.app.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!(environment = %config.app.environment, "Starting cinema booking API");

    // Connect to the database
    let db = Database::connect(&config.database)
        .await
        .context("failed to connect to database")?;
    db.run_migrations().await.context("failed to run migrations")?;

    // Redis is optional; without it listings are served uncached
    let cache = match &config.redis {
        Some(redis) => match RedisClient::connect(&redis.url).await {
            Ok(client) => Some(CacheService::new(client, redis.cache_ttl_seconds)),
            Err(e) => {
                warn!("Redis unavailable, showtime cache disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let notifier: Arc<dyn Notifier> = match &config.notifier.hub_url {
        Some(url) => Arc::new(HubNotifier::new(url.clone(), &config.notifier).context("failed to build notifier")?),
        None => Arc::new(NoopNotifier),
    };

    let state = AppState::new(
        &config,
        Arc::new(PgStore::new(db)),
        Arc::new(SystemClock),
        notifier,
        cache,
    );

    // --- Background housekeeping ---
    let cleanup = state
        .cleanup
        .clone()
        .spawn(Duration::from_secs(config.booking.cleanup_interval_seconds));

    // --- Web server ---
    let app = router(state);
    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port)
        .parse()
        .context("invalid listen address")?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    cleanup.abort();
    info!("Server stopped");
    Ok(())
}
