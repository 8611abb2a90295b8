use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use torale::config::Config;
use torale::services::init;
use torale::{routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "torale=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Torale scheduling engine");

    // Initialize database
    let pool = init::init_db(&config).await?;

    // One shutdown channel fans out to the scheduler loop, its workers and
    // the delivery chains.
    let (shutdown_tx, _) = broadcast::channel(8);

    let engine = init::build_engine(pool.clone(), &config, shutdown_tx.clone())?;
    let scheduler_handle = tokio::spawn(Arc::clone(&engine.scheduler).run());

    // Internal operational surface: health only. Task CRUD lives in the
    // external API service, which consumes this crate's TaskService.
    let app_state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
    });
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // The scheduler enforces its own grace period before giving up on
    // in-flight firings.
    scheduler_handle.await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: broadcast::Sender<()>) {
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received");
    let _ = shutdown.send(());
}
