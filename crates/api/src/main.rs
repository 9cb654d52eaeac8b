//! Tenantdesk API Server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenantdesk_api::{routes::create_router, AppState, Config};
use tenantdesk_shared::{create_pool, run_migrations, MemoryCache, RedisCache, TaggedCache};

/// Key prefix for everything the API stores in Redis
const CACHE_PREFIX: &str = "tenantdesk";

/// How often expired rate-limit windows and memory cache entries are dropped
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tenantdesk_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Tenantdesk API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(config = ?config, "Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        tracing::info!("Running database migrations...");
        run_migrations(&pool).await?;
        tracing::info!("Database migrations applied");
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS not set)");
    }

    let cache = permission_cache(config.redis_url.as_deref()).await;

    let addr: SocketAddr = config.bind_address.parse()?;
    let cors = cors_layer(&config.allowed_origins);

    let state = AppState::new(pool, config, cache);

    let rate_limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            ticker.tick().await;
            rate_limiter.cleanup().await;
        }
    });

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Redis when configured and reachable, otherwise the in-process cache
async fn permission_cache(redis_url: Option<&str>) -> Arc<dyn TaggedCache> {
    let Some(url) = redis_url else {
        tracing::info!("REDIS_URL not set, using in-memory permission cache");
        return memory_cache();
    };

    match RedisCache::connect(url, CACHE_PREFIX).await {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable, falling back to in-memory permission cache");
            memory_cache()
        }
    }
}

/// In-process cache with a background task purging expired entries
fn memory_cache() -> Arc<dyn TaggedCache> {
    let cache = MemoryCache::new();
    let purger = cache.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            ticker.tick().await;
            let purged = purger.purge_expired().await;
            if purged > 0 {
                tracing::debug!(purged = purged, "Expired permission cache entries purged");
            }
        }
    });
    Arc::new(cache)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
        ])
        .allow_credentials(true)
}
