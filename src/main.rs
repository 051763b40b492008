use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use boxfeed::api::NewsApi;
use boxfeed::cache::{run_writer, FeedCache};
use boxfeed::config::Config;
use boxfeed::db::Database;
use boxfeed::loader::{start_background_refresh, FeedLoader};
use boxfeed::routes::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boxfeed=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::var("BOXFEED_CONFIG").unwrap_or_else(|_| "boxfeed.toml".to_string());
    let config = Config::load(&config_path)?;
    info!(
        "Loaded {} seed boxes from {}, news API at {}",
        config.boxes.len(),
        config_path,
        config.api.base_url
    );

    // Initialize database
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:boxfeed.db?mode=rwc".to_string());
    let db = Database::new(&database_url).await?;
    db.initialize().await?;
    db.sync_boxes(&config.boxes).await?;
    info!("Database initialized");

    let db = Arc::new(db);
    let api = Arc::new(NewsApi::new(&config.api)?);

    let cache = Arc::new(FeedCache::new(db.clone(), &config.cache));
    tokio::spawn(run_writer(cache.clone()));

    let loader = Arc::new(FeedLoader::new(db.clone(), api.clone(), cache.clone()));

    // Start background refresh task
    let bg_loader = loader.clone();
    let refresh_interval = config.refresh_interval;
    tokio::spawn(async move {
        start_background_refresh(bg_loader, refresh_interval).await;
    });

    let state = Arc::new(AppState {
        db,
        loader,
        api,
        cache: cache.clone(),
    });
    let app = routes::router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("Server starting on http://{}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Don't lose cache writes still waiting out the debounce
    if let Err(e) = cache.flush().await {
        error!("Failed to flush feed cache on shutdown: {}", e);
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
}
