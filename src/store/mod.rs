//! Event store: reminder rows and their outbox, written in atomic units.
//!
//! Every mutating reminder operation appends exactly one [`OutboxEvent`] in
//! the same unit as the row change, so a crash after commit can neither
//! lose the event nor leave an event without its state change.
//!
//! ```text
//!  create/update/delete ──┐
//!                         ▼
//!  ┌──────────────────────────────────────┐
//!  │ EventStore                           │
//!  │  reminders   (pending → sent)        │
//!  │  outbox      (pending → sent|failed) │
//!  └──────────────────────────────────────┘
//!      ▲ trigger_notification     │ claim_pending / mark_sent / record_failure
//!      │                          ▼
//!   DueScanner               OutboxRelay
//! ```

mod in_memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{NewOutboxEvent, NewReminder, OutboxEvent, Reminder, ReminderUpdate};

pub use in_memory::InMemoryEventStore;
#[cfg(feature = "postgres")]
pub use postgres::PgEventStore;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a pending reminder together with its `created` event.
    async fn create_reminder(&self, reminder: NewReminder) -> Result<Reminder, StoreError>;

    async fn get_reminder(&self, id: i64) -> Result<Option<Reminder>, StoreError>;

    /// All reminders owned by `user_id`, earliest due first.
    async fn list_reminders(&self, user_id: i64) -> Result<Vec<Reminder>, StoreError>;

    /// Apply `update` and append an `updated` event. Status is not touched.
    async fn update_reminder(
        &self,
        id: i64,
        update: ReminderUpdate,
    ) -> Result<Reminder, StoreError>;

    /// Remove the reminder and append a `deleted` event.
    async fn delete_reminder(&self, id: i64) -> Result<(), StoreError>;

    /// Append an event that has no accompanying row change.
    async fn append_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError>;

    /// Pending reminders with `due_at <= now`, oldest due first.
    async fn due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reminder>, StoreError>;

    /// Append a `notification_trigger` event and mark the reminder sent.
    ///
    /// Returns `false` without writing anything when the reminder is gone or
    /// no longer pending.
    async fn trigger_notification(&self, reminder: &Reminder) -> Result<bool, StoreError>;

    /// Lease up to `limit` pending events to `worker_id`, oldest first.
    ///
    /// Events held by another worker's live lease are skipped.
    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    async fn mark_sent(&self, id: i64) -> Result<(), StoreError>;

    /// Bump `retry_count` and record the error; the event stays pending.
    ///
    /// Returns the new retry count.
    async fn record_failure(&self, id: i64, error: &str) -> Result<u32, StoreError>;

    /// Drop the lease without counting an attempt; the event stays pending.
    async fn release(&self, id: i64) -> Result<(), StoreError>;

    /// Park the event as `failed`; it is never claimed again.
    async fn dead_letter(&self, id: i64, error: &str) -> Result<(), StoreError>;

    /// Every event recorded for the aggregate, in creation order.
    async fn events_for_aggregate(&self, aggregate_id: i64)
        -> Result<Vec<OutboxEvent>, StoreError>;
}
