use axum::{
    extract::FromRef,
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dispatch_server::{
    config::Config,
    controller::{ConnectionController, ConversationController},
    handlers, health, jobs,
    lock::DistLock,
    metrics,
    models::{ConnectionModel, ConversationModel},
    realtime::{self, Hub},
    store::{keys, Kv},
};

// Composite state for Axum
#[derive(Clone, FromRef)]
struct AppState {
    config: Arc<Config>,
    kv: Kv,
    hub: Arc<Hub>,
    connection_controller: Arc<ConnectionController>,
    conversation_controller: Arc<ConversationController>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }

        #[cfg(not(debug_assertions))]
        {
            "info".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting Human Review Dispatcher");

    let config = Arc::new(Config::from_env());
    if config.scoring_key_is_default() {
        tracing::warn!("SCORING_KEY is the default. Make sure you change this in DEV");
    }

    // Initialize metrics
    let metrics_recorder = metrics::MetricsRecorder::new()?;
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("Metrics initialized");

    // Connect to the KV store
    let kv = Kv::connect(&config.redis_url).await?;
    tracing::info!("KV store initialized");

    // Cross-worker event fan-out
    let hub = Arc::new(Hub::new(kv.clone()));
    let shutdown = CancellationToken::new();
    {
        let hub = hub.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { hub.run_subscriber(shutdown).await });
    }
    tracing::info!("Event subscriber started");

    // Distributed lock: queue mutations + sweeper leader election
    let lock = DistLock::new(kv.clone(), keys::LOCK_NAME);
    lock.clone().start(num_workers());

    // Models and controllers
    let connection_model = ConnectionModel::new(kv.clone());
    let conversation_model = ConversationModel::new(kv.clone(), lock.clone());
    let connection_controller = Arc::new(ConnectionController::new(
        connection_model.clone(),
        conversation_model.clone(),
        hub.clone(),
    ));
    let conversation_controller = Arc::new(ConversationController::new(
        conversation_model,
        connection_model,
        hub.clone(),
        config.scoring_key.clone(),
    ));

    // Spawn the periodic sweeper
    {
        let lock = lock.clone();
        let connections = connection_controller.clone();
        let conversations = conversation_controller.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            jobs::run_tick_worker(lock, connections, conversations, shutdown).await;
        });
    }
    tracing::info!("Review sweeper started");

    let app_state = AppState {
        config: config.clone(),
        kv,
        hub,
        connection_controller,
        conversation_controller,
    };

    // Only expose metrics when explicitly enabled
    let metrics_router = if config.metrics_enabled {
        Router::new()
            .route("/metrics", get(metrics::metrics_handler))
            .with_state(metrics_handle)
    } else {
        Router::new()
    };

    let app = Router::new()
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/api/score", post(handlers::submit_review))
        .route("/ws", get(realtime::reviewer_socket))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    shutdown.cancel();
    lock.stop();
    tracing::info!("Lock stopped");

    Ok(())
}

fn num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown signal handler");
    }
}
