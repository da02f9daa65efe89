//! Apple Push Notification Service (APNS) gateway.
//!
//! Sends are fire-and-forget: callers reserve an identifier with
//! [`ApnsGateway::next_identifier`], then [`ApnsGateway::send`] returns as
//! soon as the request is queued. The outcome arrives later as an
//! [`ApnsFeedback`] on the feedback channel, keyed by that identifier.

use crate::config::Config;
use crate::models::Version;
use a2::{
    Client, ClientConfig, DefaultNotificationBuilder, Endpoint, NotificationBuilder,
    NotificationOptions, Priority, PushType,
};
use async_trait::async_trait;
use serde::Serialize;
use std::fs::File;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Gateway status codes reported through feedback
pub mod status {
    pub const SUCCESS: u8 = 0;
    pub const PROCESSING_ERROR: u8 = 1;
    pub const MISSING_DEVICE_TOKEN: u8 = 2;
    pub const MISSING_TOPIC: u8 = 3;
    pub const MISSING_PAYLOAD: u8 = 4;
    pub const INVALID_TOKEN_SIZE: u8 = 5;
    pub const INVALID_TOPIC_SIZE: u8 = 6;
    pub const INVALID_PAYLOAD_SIZE: u8 = 7;
    pub const INVALID_TOKEN: u8 = 8;
    pub const SHUTDOWN: u8 = 10;
    pub const UNKNOWN: u8 = 255;

    /// Worth one more attempt with the same payload
    pub fn is_retryable(status: u8) -> bool {
        matches!(status, PROCESSING_ERROR | UNKNOWN)
    }

    pub fn describe(status: u8) -> &'static str {
        match status {
            SUCCESS => "No errors encountered",
            PROCESSING_ERROR => "Processing error",
            MISSING_DEVICE_TOKEN => "Missing device token",
            MISSING_TOPIC => "Missing topic",
            MISSING_PAYLOAD => "Missing payload",
            INVALID_TOKEN_SIZE => "Invalid token size",
            INVALID_TOPIC_SIZE => "Invalid topic size",
            INVALID_PAYLOAD_SIZE => "Invalid payload size",
            INVALID_TOKEN => "Invalid token",
            SHUTDOWN => "Shutdown",
            _ => "None (unknown)",
        }
    }

    /// Map an HTTP/2 APNS response code onto a feedback status
    pub fn from_http(code: u16) -> u8 {
        match code {
            200 => SUCCESS,
            400 | 410 => INVALID_TOKEN,
            413 => INVALID_PAYLOAD_SIZE,
            429 | 500 | 503 => PROCESSING_ERROR,
            _ => UNKNOWN,
        }
    }
}

/// Notification contents sent to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApnsPayload {
    pub title: String,
    pub channel_id: String,
    pub version: Version,
    pub data: Option<String>,
}

/// Delayed outcome of one send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApnsFeedback {
    pub status: u8,
    pub identifier: u32,
}

/// APNS gateway errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("APNS key unavailable: {0}")]
    Key(String),

    #[error("APNS client error: {0}")]
    Client(String),

    #[error("APNS send failed: {0}")]
    Send(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApnsGateway: Send + Sync {
    /// Reserve the identifier the next send's feedback will carry
    fn next_identifier(&self) -> u32;

    /// Queue a send; its outcome is reported later under `identifier`
    async fn send(&self, identifier: u32, token: &str, payload: &ApnsPayload) -> Result<(), GatewayError>;
}

/// HTTP/2 APNS gateway backed by `a2`
pub struct A2Gateway {
    client: Arc<Client>,
    bundle_id: String,
    next_identifier: AtomicU32,
    feedback: mpsc::UnboundedSender<ApnsFeedback>,
}

impl A2Gateway {
    /// Create a token-authenticated client from configuration
    pub fn new(
        config: &Config,
        feedback: mpsc::UnboundedSender<ApnsFeedback>,
    ) -> Result<Self, GatewayError> {
        let (Some(team_id), Some(key_id), Some(key_path), Some(bundle_id)) = (
            config.apns_team_id.as_deref(),
            config.apns_key_id.as_deref(),
            config.apns_key_path.as_deref(),
            config.apns_bundle_id.as_deref(),
        ) else {
            return Err(GatewayError::Key("APNS is not configured".to_string()));
        };

        let mut key_file = File::open(key_path)
            .map_err(|e| GatewayError::Key(format!("{key_path}: {e}")))?;

        let endpoint = if config.apns_sandbox {
            Endpoint::Sandbox
        } else {
            Endpoint::Production
        };

        let client = Client::token(&mut key_file, key_id, team_id, ClientConfig::new(endpoint))
            .map_err(|e| GatewayError::Client(e.to_string()))?;

        debug!(sandbox = config.apns_sandbox, "APNS client initialized");

        Ok(Self {
            client: Arc::new(client),
            bundle_id: bundle_id.to_string(),
            next_identifier: AtomicU32::new(1),
            feedback,
        })
    }
}

#[async_trait]
impl ApnsGateway for A2Gateway {
    fn next_identifier(&self) -> u32 {
        self.next_identifier.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, identifier: u32, token: &str, payload: &ApnsPayload) -> Result<(), GatewayError> {
        if self.feedback.is_closed() {
            return Err(GatewayError::Send("feedback listener stopped".to_string()));
        }

        let client = self.client.clone();
        let topic = self.bundle_id.clone();
        let token = token.to_string();
        let payload = payload.clone();
        let feedback = self.feedback.clone();

        tokio::spawn(async move {
            let status = deliver(&client, &topic, &token, &payload).await;
            if feedback.send(ApnsFeedback { status, identifier }).is_err() {
                debug!(identifier, "Feedback listener gone, dropping APNS result");
            }
        });

        Ok(())
    }
}

/// Perform one HTTP/2 send and reduce the outcome to a feedback status
async fn deliver(client: &Client, topic: &str, token: &str, payload: &ApnsPayload) -> u8 {
    let options = NotificationOptions {
        apns_priority: Some(Priority::High),
        apns_topic: Some(topic),
        apns_push_type: Some(PushType::Alert),
        ..Default::default()
    };

    let mut notification = DefaultNotificationBuilder::new()
        .set_title(&payload.title)
        .set_content_available()
        .build(token, options);

    let version = payload.version.to_string();
    let custom: [(&str, Option<&str>); 3] = [
        ("Chid", Some(payload.channel_id.as_str())),
        ("Ver", Some(version.as_str())),
        ("Msg", payload.data.as_deref()),
    ];
    for (key, value) in custom {
        if let Err(e) = notification.add_custom_data(key, &value) {
            debug!(key, error = %e, "Failed to add custom data to payload");
        }
    }

    match client.send(notification).await {
        Ok(response) => status::from_http(response.code),
        Err(a2::Error::ResponseError(response)) => {
            warn!(code = response.code, "APNS rejected notification");
            status::from_http(response.code)
        }
        Err(e) => {
            debug!(error = %e, "Failed to send push notification");
            status::UNKNOWN
        }
    }
}
