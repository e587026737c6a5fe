use axum::{extract::FromRef, routing::get, Router};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metaspace_server::{config::WsConfig, health, metrics, realtime, router::SpaceRouter, store};

// Composite state for Axum
#[derive(Clone, FromRef)]
struct AppState {
    db_pool: PgPool,
    space_router: Arc<SpaceRouter>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Default to warn in production, debug in development
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }

        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting Metaspace fabric server");

    let config = WsConfig::default();
    tracing::info!(
        ws_host = %config.ws_host,
        ws_port = config.ws_port,
        invite_expiry_hours = config.invite_expiry_hours,
        "Configuration loaded"
    );

    // Initialize metrics
    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("Metrics initialized");

    // Initialize database
    let db_pool = store::init_pool(&config.db).await?;
    tracing::info!("Database pool initialized");

    // The router owns all cross-space state: broadcasters and the
    // user -> connection map.
    let pg_store = Arc::new(store::PgStore::new(db_pool.clone()));
    let space_router = SpaceRouter::new(pg_store);
    tracing::info!("Space router initialized");

    let app_state = AppState {
        db_pool: db_pool.clone(),
        space_router: space_router.clone(),
    };

    // Only expose metrics when explicitly enabled
    let metrics_router = if matches!(
        std::env::var("ENABLE_METRICS").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    ) {
        Router::new()
            .route("/metrics", get(metrics::metrics_handler))
            .with_state(metrics_handle)
    } else {
        Router::new()
    };

    let app = Router::new()
        // Health check endpoints
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        // The streaming channel
        .route("/ws/metaverse/space", get(realtime::space_channel))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let listener =
        tokio::net::TcpListener::bind((config.ws_host.as_str(), config.ws_port)).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // Queues are not drained on shutdown; broadcasters and parsers are
    // cancelled, then the store pool closes.
    space_router.shutdown_all().await;
    db_pool.close().await;
    tracing::info!("Server stopped");

    Ok(())
}
