//! PostgreSQL event store.
//!
//! Every atomic unit is one SQL transaction. Relay claims use
//! `FOR UPDATE SKIP LOCKED` plus a lease column so several relays can share
//! one outbox table without publishing the same row concurrently.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};

use super::EventStore;
use crate::error::StoreError;
use crate::model::{
    EventType, NewOutboxEvent, NewReminder, OutboxEvent, OutboxStatus, Reminder, ReminderStatus,
    ReminderUpdate,
};

#[derive(Debug, sqlx::FromRow)]
struct ReminderRow {
    id: i64,
    user_id: i64,
    title: String,
    description: String,
    due_at: DateTime<Utc>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ReminderRow> for Reminder {
    type Error = StoreError;

    fn try_from(row: ReminderRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<ReminderStatus>()
            .map_err(|reason| StoreError::Corrupt {
                entity: "reminder",
                id: row.id,
                reason,
            })?;
        Ok(Reminder {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            description: row.description,
            due_at: row.due_at,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    aggregate_id: i64,
    user_id: i64,
    event_type: String,
    payload: Vec<u8>,
    status: String,
    retry_count: i32,
    last_error: Option<String>,
    locked_by: Option<String>,
    locked_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt {
            entity: "outbox event",
            id: row.id,
            reason,
        };
        let event_type = row.event_type.parse::<EventType>().map_err(corrupt)?;
        let status = row.status.parse::<OutboxStatus>().map_err(corrupt)?;
        Ok(OutboxEvent {
            id: row.id,
            aggregate_id: row.aggregate_id,
            user_id: row.user_id,
            event_type,
            payload: row.payload,
            status,
            retry_count: u32::try_from(row.retry_count).unwrap_or_default(),
            last_error: row.last_error,
            created_at: row.created_at,
            sent_at: row.sent_at,
            locked_by: row.locked_by,
            locked_until: row.locked_until,
        })
    }
}

const REMINDER_COLUMNS: &str =
    "id, user_id, title, description, due_at, status, created_at, updated_at";

const OUTBOX_COLUMNS: &str = "id, aggregate_id, user_id, event_type, payload, status, \
     retry_count, last_error, locked_by, locked_until, created_at, sent_at";

async fn insert_event(
    conn: &mut PgConnection,
    event: NewOutboxEvent,
) -> Result<OutboxEvent, StoreError> {
    let row: OutboxRow = sqlx::query_as(&format!(
        "INSERT INTO outbox_events (aggregate_id, user_id, event_type, payload) \
         VALUES ($1, $2, $3, $4) RETURNING {OUTBOX_COLUMNS}"
    ))
    .bind(event.aggregate_id)
    .bind(event.user_id)
    .bind(event.event_type.as_str())
    .bind(&event.payload)
    .fetch_one(&mut *conn)
    .await?;
    row.try_into()
}

/// Event store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Connect and apply the bundled migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("event store migrations applied");
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn create_reminder(&self, reminder: NewReminder) -> Result<Reminder, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: ReminderRow = sqlx::query_as(&format!(
            "INSERT INTO reminders (user_id, title, description, due_at) \
             VALUES ($1, $2, $3, $4) RETURNING {REMINDER_COLUMNS}"
        ))
        .bind(reminder.user_id)
        .bind(&reminder.title)
        .bind(&reminder.description)
        .bind(reminder.due_at)
        .fetch_one(&mut *tx)
        .await?;
        let created = Reminder::try_from(row)?;

        let event = NewOutboxEvent::lifecycle(EventType::Created, &created, created.created_at)?;
        insert_event(&mut *tx, event).await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn get_reminder(&self, id: i64) -> Result<Option<Reminder>, StoreError> {
        let row: Option<ReminderRow> = sqlx::query_as(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Reminder::try_from).transpose()
    }

    async fn list_reminders(&self, user_id: i64) -> Result<Vec<Reminder>, StoreError> {
        let rows: Vec<ReminderRow> = sqlx::query_as(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders WHERE user_id = $1 ORDER BY due_at, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Reminder::try_from).collect()
    }

    async fn update_reminder(
        &self,
        id: i64,
        update: ReminderUpdate,
    ) -> Result<Reminder, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<ReminderRow> = sqlx::query_as(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(StoreError::reminder_not_found(id));
        };

        let now = Utc::now();
        let mut reminder = Reminder::try_from(row)?;
        reminder.apply(update, now);

        sqlx::query(
            "UPDATE reminders SET title = $2, description = $3, due_at = $4, updated_at = $5 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(&reminder.title)
        .bind(&reminder.description)
        .bind(reminder.due_at)
        .bind(reminder.updated_at)
        .execute(&mut *tx)
        .await?;

        let event = NewOutboxEvent::lifecycle(EventType::Updated, &reminder, now)?;
        insert_event(&mut *tx, event).await?;

        tx.commit().await?;
        Ok(reminder)
    }

    async fn delete_reminder(&self, id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<ReminderRow> = sqlx::query_as(&format!(
            "DELETE FROM reminders WHERE id = $1 RETURNING {REMINDER_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(StoreError::reminder_not_found(id));
        };

        let reminder = Reminder::try_from(row)?;
        let event = NewOutboxEvent::lifecycle(EventType::Deleted, &reminder, Utc::now())?;
        insert_event(&mut *tx, event).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn append_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_event(&mut *conn, event).await
    }

    async fn due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reminder>, StoreError> {
        let rows: Vec<ReminderRow> = sqlx::query_as(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders \
             WHERE status = 'pending' AND due_at <= $1 \
             ORDER BY due_at, id LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Reminder::try_from).collect()
    }

    async fn trigger_notification(&self, reminder: &Reminder) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock plus the status predicate make concurrent scanners race
        // on a single winner.
        let row: Option<ReminderRow> = sqlx::query_as(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders \
             WHERE id = $1 AND status = 'pending' FOR UPDATE"
        ))
        .bind(reminder.id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let current = Reminder::try_from(row)?;
        let event = NewOutboxEvent::notification_trigger(&current)?;
        insert_event(&mut *tx, event).await?;

        sqlx::query("UPDATE reminders SET status = 'sent', updated_at = NOW() WHERE id = $1")
            .bind(reminder.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            "UPDATE outbox_events o \
             SET locked_by = $1, \
                 locked_until = NOW() + ($3::double precision * INTERVAL '1 millisecond') \
             FROM ( \
                 SELECT id FROM outbox_events \
                 WHERE status = 'pending' AND (locked_until IS NULL OR locked_until <= NOW()) \
                 ORDER BY created_at, id \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) picked \
             WHERE o.id = picked.id \
             RETURNING {}",
            OUTBOX_COLUMNS
                .split(", ")
                .map(|c| format!("o.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(worker_id)
        .bind(limit as i64)
        .bind(lease.as_millis() as f64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match OutboxEvent::try_from(row) {
                Ok(event) => claimed.push(event),
                Err(err) => {
                    warn!(event_id = id, error = %err, "dead-lettering undecodable outbox row");
                    self.dead_letter(id, &err.to_string()).await?;
                }
            }
        }
        // RETURNING does not preserve the subquery order.
        claimed.sort_by_key(|e| (e.created_at, e.id));
        Ok(claimed)
    }

    async fn mark_sent(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE outbox_events \
             SET status = CASE WHEN status = 'pending' THEN 'sent' ELSE status END, \
                 sent_at = CASE WHEN status = 'pending' THEN NOW() ELSE sent_at END, \
                 last_error = CASE WHEN status = 'pending' THEN NULL ELSE last_error END, \
                 locked_by = NULL, locked_until = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::event_not_found(id));
        }
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<u32, StoreError> {
        let count: Option<(i32,)> = sqlx::query_as(
            "UPDATE outbox_events \
             SET retry_count = retry_count + 1, last_error = $2, \
                 locked_by = NULL, locked_until = NULL \
             WHERE id = $1 RETURNING retry_count",
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;
        let (count,) = count.ok_or_else(|| StoreError::event_not_found(id))?;
        Ok(u32::try_from(count).unwrap_or_default())
    }

    async fn release(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE outbox_events SET locked_by = NULL, locked_until = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::event_not_found(id));
        }
        Ok(())
    }

    async fn dead_letter(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE outbox_events \
             SET status = CASE WHEN status = 'pending' THEN 'failed' ELSE status END, \
                 last_error = $2, locked_by = NULL, locked_until = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::event_not_found(id));
        }
        Ok(())
    }

    async fn events_for_aggregate(
        &self,
        aggregate_id: i64,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE aggregate_id = $1 ORDER BY id"
        ))
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OutboxEvent::try_from).collect()
    }
}
