//! Warden Server - Request-defense pipeline
//!
//! This server handles:
//! - Layered rate limiting per endpoint, user and IP
//! - Fraud scoring of authentication attempts with automated lockouts
//! - Device-bound, integrity-sealed sessions with idle and absolute timeouts
//!
//! State lives in a shared store (Redis in production) so any number of
//! nodes can run side by side.

mod abuse;
mod audit;
mod clock;
mod config;
mod error;
mod fraud;
mod pipeline;
mod routes;
mod session;
mod store;

use clock::{Clock, SystemClock};
use config::StoreBackend;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::{MemoryStore, RedisStore, StateStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the in-memory backend drops expired keys
const MEMORY_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,warden_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::from_env()?;
    tracing::info!("Starting Warden server on {}:{}", config.host, config.port);
    tracing::info!(
        "Store backend: {:?} (timeout {:?})",
        config.store_backend,
        config.store_timeout
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn StateStore> = match config.store_backend {
        StoreBackend::Redis => {
            tracing::info!("Connecting to Redis...");
            let client = store::redis::init_client(&config.redis_url).await?;
            Arc::new(RedisStore::new(client, config.store_timeout))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; state is not shared between nodes");
            let memory = Arc::new(MemoryStore::new(clock.clone()));

            let cleanup = memory.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(MEMORY_CLEANUP_INTERVAL);
                loop {
                    interval.tick().await;
                    cleanup.cleanup();
                }
            });

            memory
        }
    };

    // Every service pings the store before it starts serving
    let state = routes::AppState::new(config.clone(), store, clock).await?;

    let app = routes::router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
