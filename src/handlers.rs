//! HTTP request handlers for the push endpoint.
//!
//! Thin front end over the routers: resolve the UAID record, build the
//! [`Notification`], dispatch, persist whatever router data comes back.

use crate::config::Config;
use crate::models::*;
use crate::router::{RouterError, RouterResponse, Routers};
use crate::storage::{Storage, StorageError};
use axum::{
    extract::{Path, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub routers: Arc<Routers>,
    /// Maximum notification payload in bytes
    pub max_data: usize,
    pub enable_cors: bool,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, routers: Arc<Routers>, config: &Config) -> Self {
        Self {
            storage,
            routers,
            max_data: config.max_data,
            enable_cors: config.enable_cors,
        }
    }
}

// === Health Check ===

/// GET /health - Health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        routers: state.routers.enabled(),
    })
}

// === Notifications ===

/// PUT /push/:uaid/:channel_id - Deliver one notification
///
/// The status code and body come from the router that owns the UAID.
pub async fn push_notification(
    State(state): State<AppState>,
    Path((uaid, channel_id)): Path<(String, String)>,
    Json(req): Json<PushRequest>,
) -> Result<Response, ApiError> {
    if req.data.as_ref().is_some_and(|d| d.len() > state.max_data) {
        return Err(ApiError::PayloadTooLarge);
    }
    if channel_id.is_empty() {
        return Err(ApiError::InvalidInput("channel_id is required"));
    }

    let record = state.storage.get_uaid(&uaid).await?;
    let router_type = record.router_type().map_err(|e| {
        error!(error = %e, "Stored record has an unknown router type");
        ApiError::Internal
    })?;
    let router = state
        .routers
        .get(router_type)
        .ok_or(ApiError::RouterDisabled(router_type))?;

    let notification = Notification::new(channel_id, Version::from_client(req.version), req.data);
    debug!(router = %router_type, channel_id = %notification.channel_id, "Routing notification");

    let response = router
        .route_notification(&notification, &record)
        .await
        .map_err(ApiError::Router)?;

    if let Some(router_data) = &response.router_data {
        // Routing already happened; a failed write only leaves stale data behind
        if let Err(e) = state.storage.update_router(&uaid, router_type, router_data).await {
            warn!(error = %e, router = %router_type, "Failed to persist router data");
        }
    }

    Ok(router_response(response))
}

// === Registration ===

/// POST /register/:router_type - Register a UAID with a router
///
/// A missing or malformed `uaid` gets a freshly generated one.
pub async fn register(
    State(state): State<AppState>,
    Path(router_type): Path<String>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let router_type: RouterType = router_type
        .parse()
        .map_err(|_| ApiError::InvalidInput("unknown router type"))?;
    let router = state
        .routers
        .get(router_type)
        .ok_or(ApiError::RouterDisabled(router_type))?;

    let uaid = match req.uaid.as_deref().map(Uuid::try_parse) {
        Some(Ok(uaid)) => uaid.simple().to_string(),
        Some(Err(_)) => {
            warn!("Invalid UAID supplied, generating a new one");
            new_uaid()
        }
        None => new_uaid(),
    };

    let router_data = router
        .register(&uaid, &req.router_input)
        .map_err(ApiError::Router)?;
    state
        .storage
        .update_router(&uaid, router_type, &router_data)
        .await?;

    info!(router = %router_type, "UAID registered");

    Ok(Json(RegisterResponse {
        uaid,
        router_type,
        router_data,
    }))
}

// === Connection Nodes ===

/// PUT /node/:uaid - A connection node announces a newly connected client
///
/// Older connections never overwrite newer ones.
pub async fn register_node(
    State(state): State<AppState>,
    Path(uaid): Path<String>,
    Json(req): Json<NodeRegistrationRequest>,
) -> Result<Json<NodeRegistrationResponse>, ApiError> {
    let valid_node = Url::parse(&req.node_id)
        .is_ok_and(|url| matches!(url.scheme(), "http" | "https") && url.has_host());
    if !valid_node {
        return Err(ApiError::InvalidInput("invalid node_id"));
    }

    let connected_at = req
        .connected_at
        .unwrap_or_else(|| Utc::now().timestamp_millis().max(0) as u64);
    let registered = state
        .storage
        .register_node(&uaid, &req.node_id, connected_at)
        .await?;

    if registered {
        debug!(node_id = %req.node_id, "Client connection registered");
    } else {
        debug!(node_id = %req.node_id, "Newer connection already recorded");
    }

    Ok(Json(NodeRegistrationResponse { registered }))
}

fn new_uaid() -> Uaid {
    Uuid::new_v4().simple().to_string()
}

/// Router outcomes are reported as plain text with the router's headers
fn text_response(status_code: u16, headers: &HashMap<String, String>, body: String) -> Response {
    let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, body).into_response();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

fn router_response(response: RouterResponse) -> Response {
    text_response(response.status_code, &response.headers, response.response_body)
}

// === Error Handling ===

/// API error types
#[derive(Debug)]
pub enum ApiError {
    InvalidInput(&'static str),
    PayloadTooLarge,
    UnknownUaid,
    /// Storage is over its provisioned capacity
    ServerBusy,
    /// The record names a router this process does not run
    RouterDisabled(RouterType),
    Internal,
    /// Classified routing failure
    Router(RouterError),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => ApiError::UnknownUaid,
            StorageError::CapacityExceeded => ApiError::ServerBusy,
            StorageError::Backend(e) => {
                error!(error = %e, "Storage failure");
                ApiError::Internal
            }
        }
    }
}

impl ApiError {
    /// Status, code and message for front end failures
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", (*msg).to_string()),
            ApiError::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", "data exceeds size limit".to_string())
            }
            ApiError::UnknownUaid => (StatusCode::NOT_FOUND, "UAID_NOT_FOUND", "uaid not found".to_string()),
            ApiError::ServerBusy => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVER_BUSY", "server busy, try again later".to_string())
            }
            ApiError::RouterDisabled(router_type) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "ROUTER_DISABLED",
                format!("{router_type} router is not enabled"),
            ),
            ApiError::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "internal server error".to_string())
            }
            ApiError::Router(err) => (
                StatusCode::from_u16(err.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                "ROUTER_ERROR",
                err.body().to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Router(err) = &self {
            if !err.logged {
                warn!(status = err.status_code, error = %err.message, "Routing failed");
            }
            return text_response(err.status_code, &err.headers, err.body().to_string());
        }

        let (status, code, message) = self.parts();
        let body = Json(ErrorResponse { error: message, code });

        (status, body).into_response()
    }
}
