/**
 * NOTIFICATIONS - Transport abstraction and fire-and-forget dispatcher
 *
 * The evaluation cycle only enqueues. A background task drains the queue and
 * bounds every delivery with a timeout; failures are counted and logged, never
 * retried and never fed back into the cooldown ledger.
 */

use crate::alerts::Notification;
use crate::error::{KernelError, KernelResult};
use crate::health::HealthTracker;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};

const QUEUE_CAPACITY: usize = 64;

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, notification: &Notification) -> KernelResult<()>;
}

/// Posts the notification as JSON to a relay (mail gateway, chat hook...).
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, request_timeout: Duration) -> KernelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| KernelError::Config(format!("webhook client: {e}")))?;
        Ok(Self { client, url: url.to_string() })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, notification: &Notification) -> KernelResult<()> {
        self.client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| KernelError::NotificationDeliveryFailed(e.to_string()))?;
        Ok(())
    }
}

/// Used when no transport is configured: the notification only reaches the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, notification: &Notification) -> KernelResult<()> {
        info!(
            subject = %notification.subject,
            recipients = ?notification.recipients,
            "notification (log transport)\n{}",
            notification.body
        );
        Ok(())
    }
}

async fn deliver_with_timeout(notifier: &dyn Notifier, notification: &Notification, limit: Duration) -> KernelResult<()> {
    match timeout(limit, notifier.deliver(notification)).await {
        Ok(result) => result,
        Err(_) => Err(KernelError::NotificationDeliveryFailed(format!("timed out after {}s", limit.as_secs_f32()))),
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::Sender<Notification>,
    notifier: Arc<dyn Notifier>,
    delivery_timeout: Duration,
    health: HealthTracker,
}

impl NotificationDispatcher {
    pub fn spawn(notifier: Arc<dyn Notifier>, delivery_timeout: Duration, health: HealthTracker) -> Self {
        let (tx, mut rx) = mpsc::channel::<Notification>(QUEUE_CAPACITY);
        let worker_notifier = notifier.clone();
        let worker_health = health.clone();
        info!(transport = notifier.name(), "notification dispatcher started");

        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                match deliver_with_timeout(worker_notifier.as_ref(), &notification, delivery_timeout).await {
                    Ok(()) => {
                        worker_health.record_delivery(true);
                        info!(kind = notification.kind.as_str(), subject = %notification.subject, "notification delivered");
                    }
                    Err(e) => {
                        worker_health.record_delivery(false);
                        warn!(kind = notification.kind.as_str(), error = %e, "notification not delivered");
                    }
                }
            }
        });

        Self { tx, notifier, delivery_timeout, health }
    }

    /// Enqueues without waiting. Returns false when the notification was dropped.
    pub fn dispatch(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                self.health.record_dropped_notification();
                warn!(kind = n.kind.as_str(), "notification queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                self.health.record_dropped_notification();
                error!(kind = n.kind.as_str(), "notification worker stopped, dropping");
                false
            }
        }
    }

    pub fn dispatch_all(&self, notifications: Vec<Notification>) {
        for n in notifications {
            self.dispatch(n);
        }
    }

    /// Delivers inline and reports the outcome; used by diagnostics.
    pub async fn deliver_now(&self, notification: &Notification) -> KernelResult<()> {
        let result = deliver_with_timeout(self.notifier.as_ref(), notification, self.delivery_timeout).await;
        self.health.record_delivery(result.is_ok());
        result
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;
    use crate::alerts::AlertKind;
    use crate::catalog::ThresholdSet;
    use time::macros::datetime;

    fn sample_notification() -> Notification {
        Notification::test(AlertKind::Voc, Some(35_000.0), "apples", &ThresholdSet::FALLBACK, &[], datetime!(2024-05-01 12:00 UTC))
    }

    async fn wait_for(health: &HealthTracker, pred: impl Fn(&crate::health::KernelHealth) -> bool) {
        for _ in 0..100 {
            if pred(&health.get_health()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_dispatch_delivers_in_background() {
        let notifier = Arc::new(RecordingNotifier::default());
        let health = HealthTracker::new(false);
        let dispatcher = NotificationDispatcher::spawn(notifier.clone(), Duration::from_secs(1), health.clone());

        assert!(dispatcher.dispatch(sample_notification()));
        wait_for(&health, |h| h.notifications_delivered == 1).await;
        assert_eq!(notifier.delivered.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_counted() {
        let notifier = Arc::new(RecordingNotifier { fail: true, ..Default::default() });
        let health = HealthTracker::new(false);
        let dispatcher = NotificationDispatcher::spawn(notifier, Duration::from_secs(1), health.clone());

        dispatcher.dispatch(sample_notification());
        wait_for(&health, |h| h.notifications_failed == 1).await;
        assert_eq!(health.get_health().notifications_delivered, 0);
    }

    #[tokio::test]
    async fn test_deliver_now_times_out() {
        let notifier = Arc::new(RecordingNotifier { stall: Some(Duration::from_millis(500)), ..Default::default() });
        let health = HealthTracker::new(false);
        let dispatcher = NotificationDispatcher::spawn(notifier, Duration::from_millis(20), health.clone());

        let err = dispatcher.deliver_now(&sample_notification()).await.unwrap_err();
        assert!(matches!(err, KernelError::NotificationDeliveryFailed(msg) if msg.contains("timed out")));
        assert_eq!(health.get_health().notifications_failed, 1);
    }

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        assert!(LogNotifier.deliver(&sample_notification()).await.is_ok());
    }
}
