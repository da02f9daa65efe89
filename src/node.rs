//! Internal bridge to connection nodes.
//!
//! A node answers `200` when it handed the notification to a live client and
//! `202` when it accepted it but the client is not actively connected. Any
//! other status, or no answer at all, means the node cannot be relied on.

use crate::models::Notification;
use async_trait::async_trait;
use std::time::Duration;

/// Node bridge errors
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("could not reach node: {0}")]
    Connect(String),

    #[error("node request failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            NodeError::Connect(err.to_string())
        } else {
            NodeError::Transport(err.to_string())
        }
    }
}

/// Node-notify protocol
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Hand a notification to the node holding `uaid`; returns the HTTP status.
    async fn push(
        &self,
        node_id: &str,
        uaid: &str,
        notification: &Notification,
    ) -> Result<u16, NodeError>;

    /// Ask the node to pull stored notifications for `uaid`; returns the HTTP status.
    async fn check(&self, node_id: &str, uaid: &str) -> Result<u16, NodeError>;
}

/// HTTP implementation of the node bridge (pooled connections)
#[derive(Clone)]
pub struct HttpNodeClient {
    http: reqwest::Client,
}

impl HttpNodeClient {
    pub fn new(timeout: Duration) -> Result<Self, NodeError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { http })
    }

    fn url(node_id: &str, action: &str, uaid: &str) -> String {
        format!("{}/{}/{}", node_id.trim_end_matches('/'), action, uaid)
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn push(
        &self,
        node_id: &str,
        uaid: &str,
        notification: &Notification,
    ) -> Result<u16, NodeError> {
        let response = self
            .http
            .put(Self::url(node_id, "push", uaid))
            .json(&[notification])
            .send()
            .await?;
        Ok(response.status().as_u16())
    }

    async fn check(&self, node_id: &str, uaid: &str) -> Result<u16, NodeError> {
        let response = self
            .http
            .put(Self::url(node_id, "notif", uaid))
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}
