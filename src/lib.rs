//! Reminder delivery pipeline.
//!
//! Reminder changes are written together with an outbox event. Two periodic
//! workers move things along from there:
//!
//! - [`due_scan::DueScanner`] turns due reminders into `notification_trigger`
//!   events,
//! - [`outbox::OutboxRelay`] publishes pending events to the broker,
//!
//! and [`notification::NotificationConsumer`] reads the notifications topic
//! and hands each reminder to a [`notification::Notifier`].

pub mod bus;
pub mod config;
pub mod due_scan;
pub mod error;
pub mod logging;
pub mod model;
pub mod notification;
pub mod outbox;
pub mod store;
pub mod worker;

pub use bus::{InMemoryBroker, Message, PublishError, Publisher, Subscriber};
pub use due_scan::{DueScanner, ScanStats};
pub use error::StoreError;
pub use model::{
    EventType, LifecycleEvent, NewReminder, OutboxEvent, OutboxStatus, Reminder, ReminderMessage,
    ReminderStatus, ReminderUpdate,
};
pub use notification::{ConsumerStats, LogNotifier, NotificationConsumer, Notifier, NotifyError};
pub use outbox::{OutboxRelay, RelayStats, Topics};
pub use store::{EventStore, InMemoryEventStore};
pub use worker::{spawn_periodic, Shutdown, ShutdownSignal, WorkerHandle, WorkerStats};
