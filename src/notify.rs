use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Ms;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BookingUnavailable,
    BookingAutoCancelled,
    BookingCancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: Ulid,
    pub kind: NotificationKind,
    pub booking_id: Option<Ulid>,
    pub title: String,
    pub message: String,
    /// "Administrator" or "System".
    pub admin_identifier: String,
    pub send_email: bool,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Records a user-facing notification and, when asked, hands it to email delivery.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// In-process notification inbox with per-user broadcast.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    inbox: DashMap<Ulid, Vec<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            inbox: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a user. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send to live subscribers. No-op if nobody is listening.
    pub fn send(&self, user_id: Ulid, notification: &Notification) {
        if let Some(sender) = self.channels.get(&user_id) {
            let _ = sender.send(notification.clone());
        }
    }

    pub fn remove(&self, user_id: &Ulid) {
        self.channels.remove(user_id);
    }

    /// Everything recorded for a user, oldest first.
    pub fn inbox(&self, user_id: Ulid) -> Vec<Notification> {
        self.inbox
            .get(&user_id)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationService for NotifyHub {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        tracing::debug!(
            user = %notification.user_id,
            kind = ?notification.kind,
            email = notification.send_email,
            "notification recorded"
        );
        self.send(notification.user_id, &notification);
        self.inbox
            .entry(notification.user_id)
            .or_default()
            .push(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(user_id: Ulid) -> Notification {
        Notification {
            user_id,
            kind: NotificationKind::BookingUnavailable,
            booking_id: Some(Ulid::new()),
            title: "Booking Unavailable - Action Required".into(),
            message: "...".into(),
            admin_identifier: "Administrator".into(),
            send_email: true,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let uid = Ulid::new();
        let mut rx = hub.subscribe(uid);

        let n = sample(uid);
        hub.notify(n.clone()).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, n);
        assert_eq!(hub.inbox(uid), vec![n]);
    }

    #[tokio::test]
    async fn notify_without_subscribers_still_records() {
        let hub = NotifyHub::new();
        let uid = Ulid::new();
        hub.notify(sample(uid)).await.unwrap();
        assert_eq!(hub.inbox(uid).len(), 1);
        assert!(hub.inbox(Ulid::new()).is_empty());
    }
}
