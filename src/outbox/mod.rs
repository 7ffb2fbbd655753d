//! Outbox relay - pending events to broker topics.
//!
//! ```text
//! EventStore ──claim_pending──► OutboxRelay ──route──► Publisher
//!     ▲                              │
//!     └── mark_sent / record_failure / dead_letter
//! ```
//!
//! Lifecycle events (`created`, `updated`, `deleted`, `notification_sent`) go
//! to the lifecycle topic; `notification_trigger` goes to the notifications
//! topic. Every message is keyed by the reminder owner's id.
//!
//! A publish failure leaves the event pending with its retry count bumped,
//! so the next pass picks it up again. An optional attempt cap parks the
//! event as `failed` instead. Payloads that do not decode are parked on the
//! first pass.

mod dispatch;
mod relay;

pub use dispatch::{
    dispatch, route, DispatchError, Topics, DEFAULT_LIFECYCLE_TOPIC, DEFAULT_NOTIFICATIONS_TOPIC,
};
pub use relay::{OutboxRelay, RelayStats, DEFAULT_BATCH_SIZE, DEFAULT_LEASE};
