//! datavault REST API server
//!
//! Composition root: configuration from the environment, database pool and
//! migrations, event bus subscribers (audit writer, search-index
//! refresher), background job workers, and the axum HTTP surface.
//!
//! ```bash
//! DATABASE_URL=postgresql://localhost/datavault cargo run --bin datavault-server
//! ```

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use datavault::api::{create_router, AppState};
use datavault::config::AppConfig;
use datavault::database::{DatabaseManager, EventLogWriter, SearchRefresher};
use datavault::events::EventBus;
use datavault::jobs::JobWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!(bind_addr = %config.bind_addr, workers = config.worker.worker_count, "starting datavault");

    let db = DatabaseManager::new(&config.database).await?;
    db.run_migrations().await?;
    db.test_connection().await?;
    let pool = db.pool().clone();

    let bus = EventBus::default();

    // Subscribers must exist before anything publishes.
    let _audit = EventLogWriter::spawn(pool.clone(), &bus);
    let refresher = SearchRefresher::spawn(pool.clone());
    let _search_sync = refresher.spawn_event_listener(&bus);

    JobWorker::spawn_all(pool.clone(), &config, &bus);

    let state = AppState::new(pool, config.clone(), bus);
    let app = create_router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
