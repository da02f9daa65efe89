//! Delivery routers.
//!
//! Every router implements [`Router`]: `register` validates router input into
//! a persistable [`RouterData`] record, `route_notification` delivers one
//! notification and yields either a [`RouterResponse`] or a [`RouterError`],
//! never both.
//!
//! | Router | Delivers via |
//! |--------|--------------|
//! | [`SimpleRouter`] | connection nodes, falling back to storage |
//! | [`ApnsRouter`] | Apple Push Notification service |
//! | [`GcmRouter`] | Google Cloud Messaging |

pub mod apns;
pub mod gcm;
pub mod simple;

pub use apns::{ApnsRouter, PendingMessage, PendingMessages};
pub use gcm::{GcmRouter, GcmSettings};
pub use simple::SimpleRouter;

use crate::apns::A2Gateway;
use crate::config::Config;
use crate::dead_cache::DeadNodeCache;
use crate::gcm::GcmClient;
use crate::metrics::Metrics;
use crate::models::{keys, Notification, RouterData, RouterType};
use crate::node::{HttpNodeClient, NodeError};
use crate::storage::{Storage, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Terminal routing success
#[derive(Debug, Clone, PartialEq)]
pub struct RouterResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub response_body: String,
    /// Updated record the caller must persist
    pub router_data: Option<RouterData>,
}

impl RouterResponse {
    pub fn new(status_code: u16, response_body: impl Into<String>) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            response_body: response_body.into(),
            router_data: None,
        }
    }

    /// Delivered to a live client
    pub fn delivered() -> Self {
        Self::new(200, "Delivered")
    }

    /// Stored for later delivery
    pub fn stored() -> Self {
        Self::new(202, "Notification Stored")
    }

    #[must_use]
    pub fn with_router_data(mut self, router_data: RouterData) -> Self {
        self.router_data = Some(router_data);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Terminal, classified routing failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} (status {status_code})")]
pub struct RouterError {
    pub status_code: u16,
    pub message: String,
    /// Body for the client; falls back to `message`
    pub response_body: Option<String>,
    pub headers: HashMap<String, String>,
    /// Set once the router has already logged this failure
    pub logged: bool,
}

impl RouterError {
    pub fn new(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
            response_body: None,
            headers: HashMap::new(),
            logged: false,
        }
    }

    /// Malformed registration input (400)
    pub fn bad_registration(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    /// UAID or registration no longer exists (404)
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    /// Transient failure, retry later (503)
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(503, message).with_header("Retry-After", "30")
    }

    /// Unclassified failure (500)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.response_body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn logged(mut self) -> Self {
        self.logged = true;
        self
    }

    /// Client-visible body
    pub fn body(&self) -> &str {
        self.response_body.as_deref().unwrap_or(&self.message)
    }
}

/// Storage failures nobody classified become internal errors
impl From<StorageError> for RouterError {
    fn from(err: StorageError) -> Self {
        RouterError::internal(format!("storage error: {err}"))
    }
}

/// Router capability contract
#[async_trait]
pub trait Router: Send + Sync {
    /// Validate router input into a minimal, persistable record
    fn register(&self, uaid: &str, router_input: &RouterData) -> Result<RouterData, RouterError>;

    /// Deliver a notification using the stored record for its UAID
    async fn route_notification(
        &self,
        notification: &Notification,
        router_data: &RouterData,
    ) -> Result<RouterResponse, RouterError>;
}

/// Bridged routers only need a device token
pub(crate) fn token_registration(router_input: &RouterData) -> Result<RouterData, RouterError> {
    router_input
        .token()
        .map(|token| RouterData::new().with(keys::TOKEN, token))
        .ok_or_else(|| RouterError::bad_registration("token is required"))
}

/// The routers enabled in this process, looked up by tag
pub struct Routers {
    simple: SimpleRouter,
    apns: Option<Arc<ApnsRouter>>,
    gcm: Option<GcmRouter>,
}

impl Routers {
    pub fn new(simple: SimpleRouter) -> Self {
        Self {
            simple,
            apns: None,
            gcm: None,
        }
    }

    #[must_use]
    pub fn with_apns(mut self, apns: Arc<ApnsRouter>) -> Self {
        self.apns = Some(apns);
        self
    }

    #[must_use]
    pub fn with_gcm(mut self, gcm: GcmRouter) -> Self {
        self.gcm = Some(gcm);
        self
    }

    pub fn get(&self, router_type: RouterType) -> Option<&dyn Router> {
        match router_type {
            RouterType::SimplePush => Some(&self.simple),
            RouterType::Apns => self.apns.as_deref().map(|r| r as &dyn Router),
            RouterType::Gcm => self.gcm.as_ref().map(|r| r as &dyn Router),
        }
    }

    pub fn enabled(&self) -> Vec<RouterType> {
        RouterType::ALL
            .into_iter()
            .filter(|t| self.get(*t).is_some())
            .collect()
    }

    /// Build every router the configuration enables.
    ///
    /// Bridged routers with broken credentials are disabled, not fatal.
    pub fn from_config(
        config: &Config,
        storage: Arc<dyn Storage>,
        dead_cache: DeadNodeCache,
        metrics: &Metrics,
    ) -> Result<Self, NodeError> {
        let node = Arc::new(HttpNodeClient::new(config.node_timeout)?);
        let mut routers = Self::new(SimpleRouter::new(node, storage, dead_cache, metrics.clone()));

        if config.apns_configured() {
            let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
            match A2Gateway::new(config, feedback_tx) {
                Ok(gateway) => {
                    let router = Arc::new(ApnsRouter::new(
                        Arc::new(gateway),
                        Arc::new(PendingMessages::new(config.apns_max_pending)),
                        config.apns_title.clone(),
                        metrics.clone(),
                    ));
                    router.clone().spawn_feedback_listener(feedback_rx);
                    routers = routers.with_apns(router);
                }
                Err(e) => error!(error = %e, "APNS router disabled"),
            }
        }

        if let Some(api_key) = &config.gcm_api_key {
            match GcmClient::new(api_key, &config.gcm_endpoint, config.node_timeout) {
                Ok(client) => {
                    routers = routers.with_gcm(GcmRouter::new(
                        Arc::new(client),
                        GcmSettings::from(config),
                        metrics.clone(),
                    ));
                }
                Err(e) => error!(error = %e, "GCM router disabled"),
            }
        }

        info!(routers = ?routers.enabled(), "Routers ready");
        Ok(routers)
    }
}
