//! Google Cloud Messaging gateway.
//!
//! One HTTP JSON send per message; the bulk response is reduced to a
//! [`GcmResult`] keyed by registration id.

use crate::models::Version;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Custom data delivered to the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GcmData {
    #[serde(rename = "Chid")]
    pub channel_id: String,
    #[serde(rename = "Ver")]
    pub version: Version,
    #[serde(rename = "Msg", skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Outbound JSON message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GcmMessage {
    pub registration_ids: Vec<String>,
    pub collapse_key: String,
    pub time_to_live: u64,
    pub dry_run: bool,
    pub data: GcmData,
}

/// Per-registration outcome of one send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcmResult {
    /// Delivered: registration id -> message id
    pub success: HashMap<String, String>,
    /// Registration id -> canonical id the device should now use
    pub canonical: HashMap<String, String>,
    /// Registration ids the gateway no longer knows
    pub not_registered: Vec<String>,
    /// Permanent failures: registration id -> error code
    pub failed: HashMap<String, String>,
    /// Transient failures worth resending
    pub unavailable: Vec<String>,
    /// Seconds the gateway asked us to back off
    pub retry_after: Option<u64>,
}

impl GcmResult {
    pub fn needs_retry(&self) -> bool {
        !self.unavailable.is_empty()
    }

    /// Every registration is retryable (gateway-wide outage)
    pub fn all_unavailable(registration_ids: &[String], retry_after: Option<u64>) -> Self {
        Self {
            unavailable: registration_ids.to_vec(),
            retry_after,
            ..Self::default()
        }
    }

    /// Pair the response `results` array with the registration ids sent
    pub fn from_response(registration_ids: &[String], response: GcmResponse) -> Self {
        let mut result = Self::default();
        let answered = response.results.len();

        for (id, entry) in registration_ids.iter().zip(response.results) {
            match (entry.message_id, entry.error) {
                (_, Some(error)) => match error.as_str() {
                    "NotRegistered" | "InvalidRegistration" => result.not_registered.push(id.clone()),
                    "Unavailable" | "InternalServerError" => result.unavailable.push(id.clone()),
                    _ => {
                        result.failed.insert(id.clone(), error);
                    }
                },
                (Some(message_id), None) => {
                    if let Some(canonical) = entry.registration_id {
                        result.canonical.insert(id.clone(), canonical);
                    }
                    result.success.insert(id.clone(), message_id);
                }
                (None, None) => {
                    result.failed.insert(id.clone(), "MissingMessageId".to_string());
                }
            }
        }

        // A short results array leaves the rest unaccounted for
        for id in registration_ids.iter().skip(answered) {
            result.failed.insert(id.clone(), "MissingResult".to_string());
        }

        result
    }
}

/// Raw GCM JSON response body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GcmResponse {
    #[serde(default)]
    pub multicast_id: Option<i64>,
    #[serde(default)]
    pub success: u32,
    #[serde(default)]
    pub failure: u32,
    #[serde(default)]
    pub canonical_ids: u32,
    #[serde(default)]
    pub results: Vec<GcmResponseEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GcmResponseEntry {
    pub message_id: Option<String>,
    pub registration_id: Option<String>,
    pub error: Option<String>,
}

/// GCM gateway errors
#[derive(Debug, thiserror::Error)]
pub enum GcmError {
    #[error("GCM rejected the API key")]
    Authentication,

    #[error("GCM request failed: {0}")]
    Transport(String),

    #[error("GCM returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for GcmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GcmError::InvalidResponse(err.to_string())
        } else {
            GcmError::Transport(err.to_string())
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GcmGateway: Send + Sync {
    async fn send(&self, message: &GcmMessage) -> Result<GcmResult, GcmError>;
}

/// HTTP JSON GCM client
pub struct GcmClient {
    http: reqwest::Client,
    endpoint: String,
    authorization: String,
}

impl GcmClient {
    pub fn new(api_key: &str, endpoint: &str, timeout: Duration) -> Result<Self, GcmError> {
        if api_key.is_empty() {
            return Err(GcmError::Authentication);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            authorization: format!("key={api_key}"),
        })
    }
}

#[async_trait]
impl GcmGateway for GcmClient {
    async fn send(&self, message: &GcmMessage) -> Result<GcmResult, GcmError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .json(message)
            .send()
            .await?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        if status == reqwest::StatusCode::UNAUTHORIZED {
            warn!("GCM authentication failed");
            return Err(GcmError::Authentication);
        }
        if status.is_server_error() {
            debug!(status = status.as_u16(), "GCM unavailable");
            return Ok(GcmResult::all_unavailable(&message.registration_ids, retry_after));
        }
        if !status.is_success() {
            return Err(GcmError::InvalidResponse(format!("HTTP {status}")));
        }

        let body: GcmResponse = response.json().await?;
        let mut result = GcmResult::from_response(&message.registration_ids, body);
        result.retry_after = retry_after;
        Ok(result)
    }
}
