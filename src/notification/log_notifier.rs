use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::info;

use super::{Notifier, NotifyError};
use crate::model::ReminderMessage;

/// Notifier that writes each reminder to the log.
///
/// A capturing notifier also keeps the rendered lines so tests can assert on
/// what was sent.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier {
    sink: Option<Arc<Mutex<Vec<String>>>>,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capturing() -> Self {
        Self {
            sink: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// Lines rendered so far. Always empty unless capturing.
    pub fn delivered(&self) -> Vec<String> {
        self.sink
            .as_ref()
            .map(|sink| sink.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    pub fn render(message: &ReminderMessage) -> String {
        format!(
            "[NOTIFICATION] Sending reminder to user {}: {} - {}",
            message.user_id, message.title, message.description
        )
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, message: &ReminderMessage) -> Result<(), NotifyError> {
        info!(
            reminder_id = message.id,
            user_id = message.user_id,
            title = %message.title,
            desc = %message.description,
            due_at = %message.due_at,
            "[NOTIFICATION] Sending reminder"
        );

        if let Some(sink) = &self.sink {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Self::render(message));
        }
        Ok(())
    }
}
