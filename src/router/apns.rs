//! Routing through Apple's push gateway.
//!
//! APNS never confirms delivery synchronously. Each send is remembered in a
//! bounded [`PendingMessages`] map under the gateway identifier so delayed
//! feedback can be matched back to it (and retried once when the gateway
//! says so). When feedback never arrives, the oldest entries are evicted.

use super::{token_registration, Router, RouterError, RouterResponse};
use crate::apns::{status, ApnsFeedback, ApnsGateway, ApnsPayload};
use crate::metrics::{names, Metrics};
use crate::models::{Notification, RouterData};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A send awaiting gateway feedback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub token: String,
    pub payload: ApnsPayload,
    /// Already resent once
    pub retried: bool,
}

#[derive(Default)]
struct PendingInner {
    /// Insertion order, oldest first
    order: VecDeque<u32>,
    messages: HashMap<u32, PendingMessage>,
}

/// Bounded identifier -> message map, oldest evicted first
pub struct PendingMessages {
    inner: Mutex<PendingInner>,
    max_size: usize,
}

impl PendingMessages {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(PendingInner::default()),
            max_size: max_size.max(1),
        }
    }

    /// Record a message, evicting the oldest entries to stay within bounds
    pub fn insert(&self, identifier: u32, message: PendingMessage) {
        let mut inner = self.inner.lock();
        if inner.messages.remove(&identifier).is_some() {
            inner.order.retain(|id| *id != identifier);
        }

        while inner.messages.len() >= self.max_size {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.messages.remove(&oldest);
            debug!(identifier = oldest, "Pruned pending APNS message");
        }

        inner.order.push_back(identifier);
        inner.messages.insert(identifier, message);
    }

    pub fn remove(&self, identifier: u32) -> Option<PendingMessage> {
        let mut inner = self.inner.lock();
        let removed = inner.messages.remove(&identifier);
        if removed.is_some() {
            inner.order.retain(|id| *id != identifier);
        }
        removed
    }

    pub fn get(&self, identifier: u32) -> Option<PendingMessage> {
        self.inner.lock().messages.get(&identifier).cloned()
    }

    /// Move a message to a new identifier (after a resend)
    pub fn replace(&self, old: u32, new: u32, message: PendingMessage) {
        self.remove(old);
        self.insert(new, message);
    }

    pub fn contains(&self, identifier: u32) -> bool {
        self.inner.lock().messages.contains_key(&identifier)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ApnsRouter {
    gateway: Arc<dyn ApnsGateway>,
    messages: Arc<PendingMessages>,
    title: String,
    metrics: Metrics,
}

impl ApnsRouter {
    pub fn new(
        gateway: Arc<dyn ApnsGateway>,
        messages: Arc<PendingMessages>,
        title: String,
        metrics: Metrics,
    ) -> Self {
        Self {
            gateway,
            messages,
            title,
            metrics,
        }
    }

    pub fn messages(&self) -> &PendingMessages {
        &self.messages
    }

    /// Reconcile one piece of gateway feedback with the pending map.
    ///
    /// Success clears the entry. A retryable status resends once and keeps
    /// the entry. Anything else is permanent and left for pruning.
    pub async fn handle_feedback(&self, feedback: ApnsFeedback) {
        let ApnsFeedback { status, identifier } = feedback;

        if status == status::SUCCESS {
            if self.messages.remove(identifier).is_some() {
                debug!(identifier, "APNS delivery confirmed");
            }
            return;
        }

        let reason = status::describe(status);
        if !status::is_retryable(status) {
            warn!(identifier, status, reason, "APNS rejected notification");
            return;
        }

        let Some(pending) = self.messages.get(identifier) else {
            debug!(identifier, status, "No pending message for APNS feedback");
            return;
        };
        if pending.retried {
            warn!(identifier, status, reason, "APNS retry failed, giving up");
            return;
        }

        info!(identifier, status, reason, "Retrying APNS notification");
        self.metrics.increment(names::APNS_RETRY);

        // Feedback for the resend may arrive before `send` returns
        let new_identifier = self.gateway.next_identifier();
        let resent = PendingMessage {
            retried: true,
            ..pending
        };
        self.messages.replace(identifier, new_identifier, resent.clone());

        if let Err(e) = self.gateway.send(new_identifier, &resent.token, &resent.payload).await {
            warn!(identifier = new_identifier, error = %e, "APNS resend failed");
            self.messages.remove(new_identifier);
        }
    }

    /// Consume feedback from the gateway until the channel closes
    pub fn spawn_feedback_listener(
        self: Arc<Self>,
        mut feedback: mpsc::UnboundedReceiver<ApnsFeedback>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Started APNS feedback listener");
            while let Some(item) = feedback.recv().await {
                self.handle_feedback(item).await;
            }
            debug!("APNS feedback channel closed");
        })
    }
}

#[async_trait]
impl Router for ApnsRouter {
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
            .ok_or_else(|| RouterError::not_found("No APNS token registered"))?;

        let payload = ApnsPayload {
            title: self.title.clone(),
            channel_id: notification.channel_id.clone(),
            version: notification.version.clone(),
            data: notification.data.clone(),
        };

        // Recorded before sending so early feedback finds the entry
        let identifier = self.gateway.next_identifier();
        self.messages.insert(
            identifier,
            PendingMessage {
                token: token.to_string(),
                payload: payload.clone(),
                retried: false,
            },
        );

        if let Err(e) = self.gateway.send(identifier, token, &payload).await {
            self.messages.remove(identifier);
            warn!(error = %e, "APNS send failed");
            return Err(RouterError::internal(format!("APNS routing error: {e}")).logged());
        }
        self.metrics.increment(names::APNS_SENT);

        Ok(RouterResponse::new(200, "Message sent"))
    }
}
