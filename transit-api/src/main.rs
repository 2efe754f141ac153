use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transit_api::{app, AppState};
use transit_booking::{BookingEngine, RetryPolicy};
use transit_core::InventoryStore;
use transit_store::app_config::{Backend, Config};
use transit_store::{MemoryStore, PgStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "transit_api=debug,transit_booking=info,transit_store=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Transit API on port {}", config.server.port);

    let store = open_store(&config).await?;
    let retry = RetryPolicy::new(
        config.retry.max_attempts,
        Duration::from_millis(config.retry.base_delay_ms),
    );
    let engine = BookingEngine::new(store, retry);

    let app = app(AppState::new(engine.clone(), config.auth.jwt_secret.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    engine.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn InventoryStore>> {
    match config.database.backend {
        Backend::Postgres => {
            let store = PgStore::connect(&config.database.url, config.pool.clone())
                .await
                .context("Failed to connect to Postgres")?;
            if config.database.run_migrations {
                store.migrate().await.context("Failed to run migrations")?;
            }
            Ok(Arc::new(store))
        }
        Backend::Memory => {
            let store = MemoryStore::open(config.pool.clone()).await?;
            let (trip, seats) = store.seed_trip(10_000, 40);
            tracing::warn!(
                trip_id = %trip.id,
                seats = seats.len(),
                "Using in-memory store; data is lost on exit. Seeded one demo trip"
            );
            Ok(Arc::new(store))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
