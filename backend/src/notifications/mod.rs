//! Outbound notifications
//!
//! Delivery itself (email, push, in-app) belongs to whoever subscribes to the
//! broadcast channel. The automation core only hands notifications over.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: Uuid, lead_id: Option<Uuid>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            lead_id,
            title: title.into(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotifyError {
    #[error("no subscriber is listening for notifications")]
    NoSubscribers,
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Fans notifications out to in-process subscribers
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let user_id = notification.user_id;
        let receivers = self
            .sender
            .send(notification)
            .map_err(|_| NotifyError::NoSubscribers)?;
        debug!(user_id = %user_id, receivers, "Notification broadcast");
        Ok(())
    }
}
