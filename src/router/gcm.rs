//! Routing through Google Cloud Messaging.

use super::{token_registration, Router, RouterError, RouterResponse};
use crate::config::Config;
use crate::gcm::{GcmData, GcmError, GcmGateway, GcmMessage};
use crate::metrics::{names, Metrics};
use crate::models::{keys, Notification, RouterData};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-message GCM options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcmSettings {
    pub collapse_key: String,
    pub ttl: u64,
    pub dry_run: bool,
}

impl From<&Config> for GcmSettings {
    fn from(config: &Config) -> Self {
        Self {
            collapse_key: config.gcm_collapse_key.clone(),
            ttl: config.gcm_ttl,
            dry_run: config.gcm_dry_run,
        }
    }
}

impl Default for GcmSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

pub struct GcmRouter {
    gateway: Arc<dyn GcmGateway>,
    settings: GcmSettings,
    metrics: Metrics,
}

impl GcmRouter {
    pub fn new(gateway: Arc<dyn GcmGateway>, settings: GcmSettings, metrics: Metrics) -> Self {
        Self {
            gateway,
            settings,
            metrics,
        }
    }

    fn message(&self, token: &str, notification: &Notification) -> GcmMessage {
        GcmMessage {
            registration_ids: vec![token.to_string()],
            collapse_key: self.settings.collapse_key.clone(),
            time_to_live: self.settings.ttl,
            dry_run: self.settings.dry_run,
            data: GcmData {
                channel_id: notification.channel_id.clone(),
                version: notification.version.clone(),
                data: notification.data.clone(),
            },
        }
    }
}

#[async_trait]
impl Router for GcmRouter {
    fn register(&self, _uaid: &str, router_input: &RouterData) -> Result<RouterData, RouterError> {
        token_registration(router_input)
    }

    async fn route_notification(
        &self,
        notification: &Notification,
        router_data: &RouterData,
    ) -> Result<RouterResponse, RouterError> {
        let token = router_data
            .token()
            .ok_or_else(|| RouterError::not_found("No GCM token registered"))?;

        let result = match self.gateway.send(&self.message(token, notification)).await {
            Ok(result) => result,
            Err(GcmError::Authentication) => {
                error!("GCM authentication error");
                return Err(RouterError::internal("Server error").logged());
            }
            Err(e) => {
                error!(error = %e, "GCM send failed");
                return Err(RouterError::internal(format!("GCM routing error: {e}")).logged());
            }
        };
        self.metrics.increment(names::GCM_SENT);

        if result.needs_retry() {
            debug!(retry_after = ?result.retry_after, "GCM asked for a retry");
            let mut err = RouterError::unavailable("Messages pending retry");
            if let Some(secs) = result.retry_after {
                err = err.with_header("Retry-After", secs.to_string());
            }
            return Err(err);
        }

        if let Some(reason) = result.failed.get(token) {
            warn!(reason, "GCM failed to deliver");
            return Err(RouterError::unavailable("GCM failed to deliver").logged());
        }

        if result.not_registered.iter().any(|t| t == token) {
            info!("GCM token no longer registered");
            return Ok(RouterResponse::new(200, "Token unregistered")
                .with_router_data(RouterData::new()));
        }

        if let Some(canonical) = result.canonical.get(token) {
            debug!("GCM returned a canonical token");
            return Ok(RouterResponse::delivered()
                .with_router_data(RouterData::new().with(keys::TOKEN, canonical.as_str())));
        }

        Ok(RouterResponse::delivered())
    }
}
