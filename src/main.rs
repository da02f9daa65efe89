//! Push Relay - notification endpoint and router host
//!
//! - Accepts notifications for a UAID over HTTP
//! - Hands them to the connection node holding the client, or stores them
//! - Bridges to APNS and GCM for registered devices

use push_relay::{
    build_router, dead_cache::DeadNodeCache, metrics::Metrics, router::Routers, AppState, Config,
    MemoryStorage, Storage,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Initialize structured logging
    init_tracing();

    // Load and validate configuration
    let config = Config::from_env();
    log_startup_info(&config);

    // Initialize core components
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(config.max_pending_per_uaid));
    let metrics = Metrics::new();

    let dead_cache = DeadNodeCache::new(config.dead_node_ttl, config.dead_node_capacity);
    dead_cache.start_cleanup_task(config.cleanup_interval);

    let routers = match Routers::from_config(&config, storage.clone(), dead_cache, &metrics) {
        Ok(routers) => Arc::new(routers),
        Err(e) => {
            error!(error = %e, "Failed to initialize routers");
            std::process::exit(1);
        }
    };

    // Build and serve the application
    let state = AppState::new(storage, routers, &config);
    let app = build_router(state);
    serve(app, &config).await;
}

/// Initialize tracing with environment-based log levels.
fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("push_relay=debug,tower_http=info")),
        )
        .init();
}

/// Log startup configuration (no secrets).
fn log_startup_info(config: &Config) {
    info!(
        bind_addr = %config.bind_addr,
        port = config.port,
        storage = "memory",
        max_data = config.max_data,
        dead_node_ttl_secs = config.dead_node_ttl.as_secs(),
        apns_enabled = config.apns_configured(),
        gcm_enabled = config.gcm_configured(),
        "Starting push relay"
    );
}

/// Bind to address and serve the application.
async fn serve(app: axum::Router, config: &Config) {
    let bind_addr = format!("{}:{}", config.bind_addr, config.port);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    info!(addr = %bind_addr, "Server listening");

    axum::serve(listener, app).await.expect("Server error");
}
