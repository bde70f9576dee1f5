//! Lotwatch - parking slot occupancy server
//!
//! Main entry point.

use lotwatch::{
    capture_source::FfmpegOpener,
    classifier::HttpClassifier,
    slot_store::{MemorySlotStore, MySqlSlotStore, SlotStore},
    state::{AppConfig, AppState},
    web_api,
};
use sqlx::mysql::MySqlPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// HTTP timeout of the detector client when inference has no deadline
const DETECTOR_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lotwatch=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Lotwatch v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        detector_url = %config.detector_url,
        detection_interval = config.pipeline.detection_interval,
        smoothing_window = config.pipeline.smoothing_window,
        overlap_threshold = config.pipeline.overlap_threshold,
        persistent = config.database_url.is_some(),
        "Configuration loaded"
    );

    // Slot store
    let store: Arc<dyn SlotStore> = match &config.database_url {
        Some(url) => {
            let pool = MySqlPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await?;
            tracing::info!("Database connected");
            Arc::new(MySqlSlotStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, slot state is kept in memory only");
            Arc::new(MemorySlotStore::new())
        }
    };

    // Detector client
    let detector = Arc::new(HttpClassifier::with_timeout(
        config.detector_url.clone(),
        config.pipeline.inference_timeout.unwrap_or(DETECTOR_HTTP_TIMEOUT),
    )?);
    match detector.health_check().await {
        Ok(true) => tracing::info!("Detector reachable"),
        _ => tracing::warn!(url = %detector.base_url(), "Detector not reachable yet"),
    }

    let state = AppState::new(
        config,
        store,
        Arc::new(FfmpegOpener::new()),
        detector.clone(),
        Some(detector),
        Handle::current(),
    );

    let app = web_api::create_router(state.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
