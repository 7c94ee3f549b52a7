use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A message for a requester about their booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Outbound delivery channel (mail, SMS, ...). Lives outside the engine.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log. Default when no delivery channel is wired.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            recipient = %notification.recipient,
            subject = %notification.subject,
            "notification: {}",
            notification.body
        );
        Ok(())
    }
}

/// A send still pending after this long is abandoned and counted as failed.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Fire-and-forget front for a `Notifier`. Delivery errors never reach the
/// caller; they are logged and counted.
pub struct NotifyHub {
    notifier: Arc<dyn Notifier>,
}

impl NotifyHub {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub fn logging() -> Self {
        Self::new(Arc::new(LogNotifier))
    }

    /// Hand the notification to a background task and return at once.
    pub fn dispatch(self: &Arc<Self>, notification: Notification) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move { hub.deliver(notification).await })
    }

    pub async fn deliver(&self, notification: Notification) {
        let sent = tokio::time::timeout(DELIVERY_TIMEOUT, self.notifier.send(&notification))
            .await
            .unwrap_or_else(|_| Err(NotifyError("timed out".into())));
        match sent {
            Ok(()) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "sent")
                    .increment(1);
            }
            Err(e) => {
                warn!(recipient = %notification.recipient, "{e}");
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "failed")
                    .increment(1);
            }
        }
    }
}
