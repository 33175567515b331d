use std::error::Error;
use std::sync::Arc;

use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use ticket_gate::build_app;
use ticket_gate::config::{Config, StoreBackend};
use ticket_gate::store::{MemoryStore, PgStore, Stores};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ticket_gate=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        e
    })?;

    let stores = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(config.scan.store_timeout * 4)
                .connect(&config.database_url)
                .await?;

            tracing::info!("Successfully connected to database");

            sqlx::migrate!().run(&pool).await?;

            tracing::info!("Migrations run successfully");

            Stores::from_backend(Arc::new(PgStore::new(pool)))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; nothing survives a restart");
            Stores::from_backend(Arc::new(MemoryStore::new()))
        }
    };

    let (app, _service) = build_app(stores, &config.signing_secret, config.scan.clone())?;

    let addr = config.bind_addr;
    tracing::info!("🚀 Server running at http://{}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
