use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::EventStore;
use crate::error::StoreError;
use crate::model::{
    EventType, NewOutboxEvent, NewReminder, OutboxEvent, OutboxStatus, Reminder, ReminderStatus,
    ReminderUpdate,
};

#[derive(Default)]
struct Tables {
    reminders: BTreeMap<i64, Reminder>,
    outbox: Vec<OutboxEvent>,
    reminder_seq: i64,
    outbox_seq: i64,
}

impl Tables {
    fn append(&mut self, event: NewOutboxEvent, now: DateTime<Utc>) -> OutboxEvent {
        self.outbox_seq += 1;
        let record = event.into_event(self.outbox_seq, now);
        self.outbox.push(record.clone());
        record
    }

    fn event_mut(&mut self, id: i64) -> Result<&mut OutboxEvent, StoreError> {
        self.outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::event_not_found(id))
    }
}

/// Event store kept in process memory.
///
/// Cloning yields another handle to the same tables. Each atomic unit runs
/// under a single write lock, so a reader never observes a row change
/// without its outbox event.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self, op: &'static str) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::LockPoisoned(op))
    }

    /// Snapshot of the whole outbox in insertion order.
    pub fn outbox(&self) -> Result<Vec<OutboxEvent>, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        Ok(tables.outbox.clone())
    }

    /// Events currently in `status`.
    pub fn events_with_status(&self, status: OutboxStatus) -> Result<Vec<OutboxEvent>, StoreError> {
        Ok(self
            .outbox()?
            .into_iter()
            .filter(|e| e.status == status)
            .collect())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn create_reminder(&self, reminder: NewReminder) -> Result<Reminder, StoreError> {
        let now = Utc::now();
        let mut tables = self.write("create reminder")?;

        let id = tables.reminder_seq + 1;
        let row = Reminder {
            id,
            user_id: reminder.user_id,
            title: reminder.title,
            description: reminder.description,
            due_at: reminder.due_at,
            status: ReminderStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        // Encode before touching the tables so a failure leaves nothing behind.
        let event = NewOutboxEvent::lifecycle(EventType::Created, &row, now)?;

        tables.reminder_seq = id;
        tables.reminders.insert(id, row.clone());
        tables.append(event, now);

        Ok(row)
    }

    async fn get_reminder(&self, id: i64) -> Result<Option<Reminder>, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::LockPoisoned("reminder read"))?;
        Ok(tables.reminders.get(&id).cloned())
    }

    async fn list_reminders(&self, user_id: i64) -> Result<Vec<Reminder>, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::LockPoisoned("reminder read"))?;
        let mut reminders: Vec<Reminder> = tables
            .reminders
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        reminders.sort_by_key(|r| (r.due_at, r.id));
        Ok(reminders)
    }

    async fn update_reminder(
        &self,
        id: i64,
        update: ReminderUpdate,
    ) -> Result<Reminder, StoreError> {
        let now = Utc::now();
        let mut tables = self.write("update reminder")?;

        let mut row = tables
            .reminders
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::reminder_not_found(id))?;
        row.apply(update, now);
        let event = NewOutboxEvent::lifecycle(EventType::Updated, &row, now)?;

        tables.reminders.insert(id, row.clone());
        tables.append(event, now);

        Ok(row)
    }

    async fn delete_reminder(&self, id: i64) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tables = self.write("delete reminder")?;

        let row = tables
            .reminders
            .get(&id)
            .ok_or_else(|| StoreError::reminder_not_found(id))?;
        let event = NewOutboxEvent::lifecycle(EventType::Deleted, row, now)?;

        tables.reminders.remove(&id);
        tables.append(event, now);

        Ok(())
    }

    async fn append_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError> {
        let mut tables = self.write("append event")?;
        Ok(tables.append(event, Utc::now()))
    }

    async fn due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reminder>, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::LockPoisoned("reminder read"))?;
        let mut due: Vec<Reminder> = tables
            .reminders
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.due_at, r.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn trigger_notification(&self, reminder: &Reminder) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut tables = self.write("trigger notification")?;

        let current = match tables.reminders.get(&reminder.id) {
            Some(row) if row.is_pending() => row.clone(),
            _ => return Ok(false),
        };
        let event = NewOutboxEvent::notification_trigger(&current)?;

        if let Some(row) = tables.reminders.get_mut(&reminder.id) {
            row.status = ReminderStatus::Sent;
            row.updated_at = now;
        }
        tables.append(event, now);

        Ok(true)
    }

    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let now = Utc::now();
        let locked_until = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(now);
        let mut tables = self.write("claim outbox")?;

        let mut claimed = Vec::new();
        // The outbox vector is in insertion order, which is creation order.
        for record in tables.outbox.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if !record.is_claimable(now) {
                continue;
            }
            record.locked_by = Some(worker_id.to_string());
            record.locked_until = Some(locked_until);
            claimed.push(record.clone());
        }

        Ok(claimed)
    }

    async fn mark_sent(&self, id: i64) -> Result<(), StoreError> {
        let mut tables = self.write("mark sent")?;
        let record = tables.event_mut(id)?;
        if record.is_pending() {
            record.status = OutboxStatus::Sent;
            record.sent_at = Some(Utc::now());
            record.last_error = None;
        }
        record.locked_by = None;
        record.locked_until = None;
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<u32, StoreError> {
        let mut tables = self.write("record failure")?;
        let record = tables.event_mut(id)?;
        record.retry_count = record.retry_count.saturating_add(1);
        record.last_error = Some(error.to_string());
        record.locked_by = None;
        record.locked_until = None;
        Ok(record.retry_count)
    }

    async fn release(&self, id: i64) -> Result<(), StoreError> {
        let mut tables = self.write("release")?;
        let record = tables.event_mut(id)?;
        record.locked_by = None;
        record.locked_until = None;
        Ok(())
    }

    async fn dead_letter(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let mut tables = self.write("dead letter")?;
        let record = tables.event_mut(id)?;
        if record.is_pending() {
            record.status = OutboxStatus::Failed;
        }
        record.last_error = Some(error.to_string());
        record.locked_by = None;
        record.locked_until = None;
        Ok(())
    }

    async fn events_for_aggregate(
        &self,
        aggregate_id: i64,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        Ok(self
            .outbox()?
            .into_iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn due_in(seconds: i64) -> NewReminder {
        NewReminder::new(
            7,
            "Pay rent",
            "Transfer before noon",
            Utc::now() + ChronoDuration::seconds(seconds),
        )
    }

    #[tokio::test]
    async fn create_appends_created_event_in_same_unit() {
        let store = InMemoryEventStore::new();
        let reminder = store.create_reminder(due_in(60)).await.unwrap();

        assert_eq!(reminder.status, ReminderStatus::Pending);
        let events = store.events_for_aggregate(reminder.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Created);
        assert_eq!(events[0].user_id, 7);
        assert!(events[0].is_pending());
    }

    #[tokio::test]
    async fn update_and_delete_each_append_one_event() {
        let store = InMemoryEventStore::new();
        let reminder = store.create_reminder(due_in(60)).await.unwrap();

        let updated = store
            .update_reminder(reminder.id, ReminderUpdate::default().title("Pay rent now"))
            .await
            .unwrap();
        assert_eq!(updated.title, "Pay rent now");

        store.delete_reminder(reminder.id).await.unwrap();
        assert!(store.get_reminder(reminder.id).await.unwrap().is_none());

        let types: Vec<_> = store
            .events_for_aggregate(reminder.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![EventType::Created, EventType::Updated, EventType::Deleted]
        );
    }

    #[tokio::test]
    async fn list_is_per_owner_and_ordered_by_due_time() {
        let store = InMemoryEventStore::new();
        let later = store.create_reminder(due_in(120)).await.unwrap();
        let sooner = store.create_reminder(due_in(30)).await.unwrap();
        store
            .create_reminder(NewReminder::new(8, "Other", "", Utc::now()))
            .await
            .unwrap();

        let ids: Vec<i64> = store
            .list_reminders(7)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![sooner.id, later.id]);
        assert!(store.list_reminders(99).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_reminder_writes_nothing() {
        let store = InMemoryEventStore::new();

        let err = store
            .update_reminder(99, ReminderUpdate::default().title("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { id: 99, .. }));
        assert!(matches!(
            store.delete_reminder(99).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.outbox().unwrap().is_empty());
    }

    #[tokio::test]
    async fn due_reminders_are_oldest_first_and_bounded() {
        let store = InMemoryEventStore::new();
        let later = store.create_reminder(due_in(-10)).await.unwrap();
        let earliest = store.create_reminder(due_in(-60)).await.unwrap();
        store.create_reminder(due_in(3600)).await.unwrap();
        let middle = store.create_reminder(due_in(-30)).await.unwrap();

        let due = store.due_reminders(Utc::now(), 10).await.unwrap();
        let ids: Vec<_> = due.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![earliest.id, middle.id, later.id]);

        let due = store.due_reminders(Utc::now(), 2).await.unwrap();
        assert_eq!(due.len(), 2);
    }

    #[tokio::test]
    async fn trigger_is_conditional_on_pending() {
        let store = InMemoryEventStore::new();
        let reminder = store.create_reminder(due_in(-1)).await.unwrap();

        assert!(store.trigger_notification(&reminder).await.unwrap());
        assert!(!store.trigger_notification(&reminder).await.unwrap());

        let stored = store.get_reminder(reminder.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReminderStatus::Sent);

        let triggers: Vec<_> = store
            .events_for_aggregate(reminder.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == EventType::NotificationTrigger)
            .collect();
        assert_eq!(triggers.len(), 1);
    }

    #[tokio::test]
    async fn claim_skips_leased_and_finished_events() {
        let store = InMemoryEventStore::new();
        for _ in 0..3 {
            store.create_reminder(due_in(60)).await.unwrap();
        }
        let lease = Duration::from_secs(60);

        let first = store.claim_pending("a", 2, lease).await.unwrap();
        assert_eq!(first.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);

        let second = store.claim_pending("b", 10, lease).await.unwrap();
        assert_eq!(second.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3]);

        store.mark_sent(1).await.unwrap();
        store.record_failure(2, "broker down").await.unwrap();

        let third = store.claim_pending("b", 10, lease).await.unwrap();
        assert_eq!(third.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn release_frees_lease_without_counting_a_retry() {
        let store = InMemoryEventStore::new();
        store.create_reminder(due_in(60)).await.unwrap();
        let lease = Duration::from_secs(60);

        store.claim_pending("a", 10, lease).await.unwrap();
        assert!(store.claim_pending("b", 10, lease).await.unwrap().is_empty());

        store.release(1).await.unwrap();
        let reclaimed = store.claim_pending("b", 10, lease).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].retry_count, 0);
        assert_eq!(reclaimed[0].last_error, None);

        assert!(matches!(
            store.release(99).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn retry_count_only_grows_and_survives_success() {
        let store = InMemoryEventStore::new();
        store.create_reminder(due_in(60)).await.unwrap();

        assert_eq!(store.record_failure(1, "timeout").await.unwrap(), 1);
        assert_eq!(store.record_failure(1, "timeout").await.unwrap(), 2);
        store.mark_sent(1).await.unwrap();

        let event = store.outbox().unwrap().remove(0);
        assert!(event.is_sent());
        assert_eq!(event.retry_count, 2);
        assert_eq!(event.last_error, None);
    }

    #[tokio::test]
    async fn dead_lettered_event_is_never_claimed() {
        let store = InMemoryEventStore::new();
        store.create_reminder(due_in(60)).await.unwrap();

        store.dead_letter(1, "undecodable payload").await.unwrap();

        let claimed = store
            .claim_pending("a", 10, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(claimed.is_empty());
        let failed = store.events_with_status(OutboxStatus::Failed).unwrap();
        assert_eq!(failed[0].last_error.as_deref(), Some("undecodable payload"));
    }
}
