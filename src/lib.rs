//! # Push Relay
//!
//! Notification relay that delivers to a UAID's live connection node or
//! through a third-party push gateway.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ App server  │────▶│  Endpoint   │────▶│  Connection │──▶ client
//! └─────────────┘     └─────────────┘     │    node     │
//!                            │            └─────────────┘
//!                  ┌─────────┼─────────┐
//!                  │         │         │
//!               Storage     APNS      GCM
//! ```
//!
//! Each UAID record names its router type. [`router::SimpleRouter`] talks to
//! connection nodes and falls back to storage; [`router::ApnsRouter`] and
//! [`router::GcmRouter`] bridge to the vendor gateways.
//!
//! ## API Overview
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/health` | GET | Health check |
//! | `/push/:uaid/:channel_id` | PUT | Deliver a notification |
//! | `/register/:router_type` | POST | Register a UAID with a router |
//! | `/node/:uaid` | PUT | Connection node records a live client |

pub mod apns;
pub mod config;
pub mod dead_cache;
pub mod gcm;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod node;
pub mod router;
pub mod storage;

pub use config::Config;
pub use handlers::AppState;
pub use storage::{MemoryStorage, Storage};

use axum::{
    http::{header, Method},
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

/// Minimum request body limit (16 KiB).
pub const MAX_BODY_SIZE: usize = 16 * 1024;

/// Build the Axum router with all endpoints and middleware.
pub fn build_router(state: AppState) -> Router {
    // JSON escaping can inflate the payload, leave room for it
    let body_limit = state.max_data.saturating_mul(2).max(MAX_BODY_SIZE);

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/push/:uaid/:channel_id", put(handlers::push_notification))
        .route("/register/:router_type", post(handlers::register))
        .route("/node/:uaid", put(handlers::register_node))
        .layer(RequestBodyLimitLayer::new(body_limit));

    // Middleware stack (order matters: last added = outermost)
    let app = if state.enable_cors {
        app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::PUT, Method::POST])
                .allow_headers([header::CONTENT_TYPE]),
        )
    } else {
        app
    };

    app.layer(TraceLayer::new_for_http()).with_state(state)
}
