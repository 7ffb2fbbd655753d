//! Due-scan worker.
//!
//! Finds pending reminders whose due time has passed and hands each one to
//! the outbox as a `notification_trigger`. The store writes the trigger and
//! flips the reminder to `sent` in one unit, conditional on it still being
//! pending, so overlapping scans never emit twice.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::EventStore;
use crate::worker::{Periodic, TickReport};

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub found: usize,
    pub triggered: usize,
    /// Already handled by someone else between the read and the write.
    pub skipped: usize,
    pub failed: usize,
}

pub struct DueScanner<S: ?Sized> {
    store: Arc<S>,
    batch_size: usize,
}

impl<S: ?Sized> DueScanner<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl<S: EventStore + ?Sized> DueScanner<S> {
    /// Trigger every reminder due at `now`, up to one batch.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<ScanStats, StoreError> {
        let due = self.store.due_reminders(now, self.batch_size).await?;
        let mut stats = ScanStats {
            found: due.len(),
            ..Default::default()
        };

        for reminder in &due {
            match self.store.trigger_notification(reminder).await {
                Ok(true) => {
                    debug!(
                        reminder_id = reminder.id,
                        user_id = reminder.user_id,
                        "triggered notification"
                    );
                    stats.triggered += 1;
                }
                Ok(false) => stats.skipped += 1,
                Err(err) => {
                    warn!(
                        reminder_id = reminder.id,
                        error = %err,
                        "failed to trigger notification"
                    );
                    stats.failed += 1;
                }
            }
        }

        if stats.found > 0 {
            info!(
                found = stats.found,
                triggered = stats.triggered,
                skipped = stats.skipped,
                failed = stats.failed,
                "scanned due reminders"
            );
        }

        Ok(stats)
    }
}

#[async_trait]
impl<S: EventStore + ?Sized + 'static> Periodic for DueScanner<S> {
    fn name(&self) -> &'static str {
        "due-scan"
    }

    async fn tick(&self) -> TickReport {
        match self.scan_once(Utc::now()).await {
            Ok(stats) => TickReport {
                processed: stats.triggered,
                failed: stats.failed,
            },
            Err(err) => {
                warn!(error = %err, "could not fetch due reminders");
                TickReport {
                    processed: 0,
                    failed: 1,
                }
            }
        }
    }
}
