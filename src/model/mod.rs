//! Domain model shared by the store, the workers and the wire format.

mod event;
mod reminder;

pub use event::{
    EventType, LifecycleEvent, NewOutboxEvent, OutboxEvent, OutboxStatus, ReminderMessage,
};
pub use reminder::{NewReminder, Reminder, ReminderStatus, ReminderUpdate};
