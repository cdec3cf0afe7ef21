//! fedirelay binary entry point

use fedirelay::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const GAUGE_REFRESH_INTERVAL_SECS: u64 = 60;
const ACTOR_CACHE_PRUNE_INTERVAL_SECS: u64 = 600;

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Initialize metrics
/// 3. Load configuration from file and environment
/// 4. Initialize AppState
/// 5. Serve HTTP until interrupted
/// 6. Drain the delivery queue
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("FEDIRELAY__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "fedirelay=info,tower_http=info".into())
    };

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting fedirelay...");

    // 2. Initialize metrics
    fedirelay::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        manual_approval = config.relay.manual_approval,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;
    let app = fedirelay::build_router(state.clone());

    // 5. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Relay actor: {}", state.relay.id);

    spawn_gauge_task(state.clone());
    spawn_cache_prune_task(state.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. Drain deliveries
    tracing::info!("Shutting down, draining delivery queue...");
    state.dispatcher.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Spawn background membership gauge refresh
fn spawn_gauge_task(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            GAUGE_REFRESH_INTERVAL_SECS,
        ));

        loop {
            interval.tick().await;
            state.membership.refresh_gauges().await;
        }
    });

    tracing::debug!("Membership gauge task spawned");
}

/// Spawn background actor cache cleanup
fn spawn_cache_prune_task(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            ACTOR_CACHE_PRUNE_INTERVAL_SECS,
        ));

        loop {
            interval.tick().await;
            state.router.fetcher().prune_cache().await;
        }
    });

    tracing::debug!("Actor cache prune task spawned");
}
