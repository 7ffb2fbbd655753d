use thiserror::Error;

/// Errors raised by an [`EventStore`](crate::store::EventStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lock poisoned during {0}")]
    LockPoisoned(&'static str),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be mapped back onto the domain model.
    #[error("corrupt {entity} row {id}: {reason}")]
    Corrupt {
        entity: &'static str,
        id: i64,
        reason: String,
    },

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "postgres")]
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub(crate) fn reminder_not_found(id: i64) -> Self {
        StoreError::NotFound {
            entity: "reminder",
            id,
        }
    }

    pub(crate) fn event_not_found(id: i64) -> Self {
        StoreError::NotFound {
            entity: "outbox event",
            id,
        }
    }
}
