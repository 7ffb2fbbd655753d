//! Notification consumer - the last hop of the pipeline.
//!
//! Reads `notification_trigger` messages from the notifications topic as a
//! member of a consumer group and hands each decoded [`ReminderMessage`] to
//! a [`Notifier`].
//!
//! The group position is committed as soon as a message is read, before the
//! notifier runs. A crash between the two loses that notification; a failed
//! delivery is logged and not retried.

mod consumer;
mod log_notifier;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::ReminderMessage;

pub use consumer::{ConsumerStats, NotificationConsumer, DEFAULT_POLL_TIMEOUT};
pub use log_notifier::LogNotifier;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("recipient {user_id} rejected: {reason}")]
    Rejected { user_id: i64, reason: String },
}

/// Delivery channel for due reminders (push, e-mail, log).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, message: &ReminderMessage) -> Result<(), NotifyError>;
}
