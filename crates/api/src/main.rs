use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use fleetwatch_api::background::telemetry_retention;
use fleetwatch_api::config::{DatabaseConfig, LogConfig, LogFormat, ServerConfig};
use fleetwatch_api::gateway::{PersistenceGateway, PgGateway};
use fleetwatch_api::router::build_app_router;
use fleetwatch_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let log_config = LogConfig::from_env();
    init_tracing(&log_config);

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(
        host = %config.host,
        port = %config.port,
        keepalive_secs = config.keepalive_secs,
        job = %config.metrics_job_name,
        "Loaded server configuration"
    );

    // --- Database ---
    let db_config = DatabaseConfig::from_env();

    let pool = fleetwatch_db::create_pool(&db_config.url, db_config.name.as_deref())
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    fleetwatch_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    tracing::info!("Database health check passed");

    fleetwatch_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Persistence gateway ---
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(PgGateway::new(
        pool,
        Duration::from_secs(config.store_timeout_secs),
    ));

    // Presence rows from a previous process would block every reconnect.
    let cleared = gateway
        .clear_online()
        .await
        .expect("Failed to clear stale presence rows");
    tracing::info!(cleared, "Cleared stale presence rows");

    // --- App state ---
    let state =
        AppState::new(config.clone(), Arc::clone(&gateway)).expect("Failed to register metrics");

    // --- Telemetry retention ---
    let retention_cancel = tokio_util::sync::CancellationToken::new();
    let retention_handle = tokio::spawn(telemetry_retention::run(
        Arc::clone(&gateway),
        config.retention_hours,
        telemetry_retention::CLEANUP_INTERVAL,
        retention_cancel.clone(),
    ));

    // --- Router ---
    let app = build_app_router(state.clone(), &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    let aborted = state
        .sessions
        .shutdown_all(
            state.shutdown_grace(),
            state.registry.as_ref(),
            state.metrics.as_ref(),
        )
        .await;
    tracing::info!(aborted, "Device sessions drained");

    retention_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), retention_handle).await;
    tracing::info!("Telemetry retention job stopped");

    tracing::info!("Graceful shutdown complete");
}

/// Install the global subscriber.
///
/// Stdout gets pretty or JSON output per `LOG_FORMAT`. When `LOG_FILE` is
/// set, a second JSON layer appends to that file.
fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let mut layers: Vec<Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>> = Vec::new();

    match config.format {
        LogFormat::Pretty => layers.push(fmt::layer().boxed()),
        LogFormat::Json => layers.push(fmt::layer().json().boxed()),
    }

    if let Some(path) = &config.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap_or_else(|e| panic!("Failed to open LOG_FILE '{path}': {e}"));
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .init();
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager (e.g. systemd, Docker, Kubernetes).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
