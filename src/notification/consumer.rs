use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::Notifier;
use crate::bus::{Delivery, Subscriber};
use crate::model::ReminderMessage;
use crate::worker::ShutdownSignal;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: usize,
    pub delivered: usize,
    /// Payload did not decode; skipped.
    pub malformed: usize,
    /// Notifier refused; not retried.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handled {
    Delivered,
    Malformed,
    Failed,
}

impl ConsumerStats {
    fn record(&mut self, handled: Handled) {
        self.received += 1;
        match handled {
            Handled::Delivered => self.delivered += 1,
            Handled::Malformed => self.malformed += 1,
            Handled::Failed => self.failed += 1,
        }
    }
}

pub struct NotificationConsumer<S: ?Sized, N: ?Sized> {
    subscriber: Arc<S>,
    notifier: Arc<N>,
    poll_timeout: Duration,
}

impl<S, N> NotificationConsumer<S, N>
where
    S: Subscriber + ?Sized,
    N: Notifier + ?Sized,
{
    pub fn new(subscriber: Arc<S>, notifier: Arc<N>) -> Self {
        Self {
            subscriber,
            notifier,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// How long one poll waits before checking for shutdown again.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Consume until `shutdown` fires. A message already read is handled
    /// to completion before returning.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        info!(poll_timeout = ?self.poll_timeout, "notification consumer started");

        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                polled = self.subscriber.poll(self.poll_timeout) => polled,
            };

            match polled {
                Ok(Some(delivery)) => stats.record(self.handle(&delivery).await),
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "error reading message");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!(
            received = stats.received,
            delivered = stats.delivered,
            malformed = stats.malformed,
            failed = stats.failed,
            "notification consumer stopped"
        );
        stats
    }

    pub(crate) async fn handle(&self, delivery: &Delivery) -> Handled {
        if let Err(err) = self.subscriber.commit(delivery).await {
            warn!(position = %delivery.position, error = %err, "failed to commit position");
        }

        let message = match delivery.message.decode::<ReminderMessage>() {
            Ok(message) => message,
            Err(err) => {
                error!(
                    error = %err,
                    data = delivery.message.payload_str().unwrap_or("<binary>"),
                    "failed to decode reminder"
                );
                return Handled::Malformed;
            }
        };

        match self.notifier.deliver(&message).await {
            Ok(()) => {
                debug!(
                    reminder_id = message.id,
                    user_id = message.user_id,
                    "notification delivered"
                );
                Handled::Delivered
            }
            Err(err) => {
                warn!(
                    reminder_id = message.id,
                    user_id = message.user_id,
                    error = %err,
                    "notification failed"
                );
                Handled::Failed
            }
        }
    }
}
