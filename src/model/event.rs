use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::reminder::Reminder;

/// Kind of change an outbox event records.
///
/// The set is closed: routing in the relay matches on it exhaustively.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    NotificationSent,
    NotificationTrigger,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Created,
        EventType::Updated,
        EventType::Deleted,
        EventType::NotificationSent,
        EventType::NotificationTrigger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Updated => "updated",
            EventType::Deleted => "deleted",
            EventType::NotificationSent => "notification_sent",
            EventType::NotificationTrigger => "notification_trigger",
        }
    }

    /// Whether the event belongs on the lifecycle stream.
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, EventType::NotificationTrigger)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
    /// Dead-lettered: the relay gave up on this event.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "sent" => Ok(OutboxStatus::Sent),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

/// Durable integration event written in the same atomic unit as the
/// reminder change it describes.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct OutboxEvent {
    pub id: i64,
    pub aggregate_id: i64,
    pub user_id: i64,
    pub event_type: EventType,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }

    pub fn is_sent(&self) -> bool {
        self.status == OutboxStatus::Sent
    }

    pub fn is_failed(&self) -> bool {
        self.status == OutboxStatus::Failed
    }

    /// Pending and not held by a live lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.locked_until.map(|until| until <= now).unwrap_or(true)
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// An outbox event that has not been assigned an id yet.
#[derive(Clone, Debug, PartialEq)]
pub struct NewOutboxEvent {
    pub aggregate_id: i64,
    pub user_id: i64,
    pub event_type: EventType,
    pub payload: Vec<u8>,
}

impl NewOutboxEvent {
    /// Lifecycle event for a reminder change, stamped `at`.
    pub fn lifecycle(
        event_type: EventType,
        reminder: &Reminder,
        at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let body = LifecycleEvent {
            event_type,
            user_id: reminder.user_id,
            aggregate_id: reminder.id,
            timestamp: at,
        };
        Ok(Self {
            aggregate_id: reminder.id,
            user_id: reminder.user_id,
            event_type,
            payload: serde_json::to_vec(&body)?,
        })
    }

    /// Trigger for the notification pipeline carrying the full reminder.
    pub fn notification_trigger(reminder: &Reminder) -> Result<Self, serde_json::Error> {
        Ok(Self {
            aggregate_id: reminder.id,
            user_id: reminder.user_id,
            event_type: EventType::NotificationTrigger,
            payload: serde_json::to_vec(reminder)?,
        })
    }

    pub(crate) fn into_event(self, id: i64, created_at: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent {
            id,
            aggregate_id: self.aggregate_id,
            user_id: self.user_id,
            event_type: self.event_type,
            payload: self.payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at,
            sent_at: None,
            locked_by: None,
            locked_until: None,
        }
    }
}

/// Wire body published to the lifecycle topic.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct LifecycleEvent {
    pub event_type: EventType,
    pub user_id: i64,
    pub aggregate_id: i64,
    pub timestamp: DateTime<Utc>,
}

/// Wire body published to the notifications topic.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ReminderMessage {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub description: String,
    pub due_at: DateTime<Utc>,
}

impl From<&Reminder> for ReminderMessage {
    fn from(reminder: &Reminder) -> Self {
        Self {
            id: reminder.id,
            user_id: reminder.user_id,
            title: reminder.title.clone(),
            description: reminder.description.clone(),
            due_at: reminder.due_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReminderStatus;

    fn reminder() -> Reminder {
        let now = Utc::now();
        Reminder {
            id: 9,
            user_id: 3,
            title: "Standup".into(),
            description: "Room 4".into(),
            due_at: now,
            status: ReminderStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn event_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventType::NotificationTrigger).unwrap(),
            r#""notification_trigger""#
        );
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>(), Ok(t));
        }
        assert!("archived".parse::<EventType>().is_err());
    }

    #[test]
    fn only_trigger_is_off_the_lifecycle_stream() {
        let lifecycle: Vec<_> = EventType::ALL.iter().filter(|t| t.is_lifecycle()).collect();
        assert_eq!(lifecycle.len(), 4);
        assert!(!EventType::NotificationTrigger.is_lifecycle());
    }

    #[test]
    fn lifecycle_payload_carries_owner_and_aggregate() {
        let r = reminder();
        let at = Utc::now();
        let event = NewOutboxEvent::lifecycle(EventType::Updated, &r, at).unwrap();

        assert_eq!(event.aggregate_id, 9);
        assert_eq!(event.user_id, 3);

        let body: LifecycleEvent = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(body.event_type, EventType::Updated);
        assert_eq!(body.aggregate_id, 9);
        assert_eq!(body.timestamp, at);
    }

    #[test]
    fn trigger_payload_decodes_as_reminder_message() {
        let r = reminder();
        let event = NewOutboxEvent::notification_trigger(&r).unwrap();

        let message: ReminderMessage = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(message, ReminderMessage::from(&r));
    }

    #[test]
    fn leased_event_is_not_claimable_until_expiry() {
        let now = Utc::now();
        let mut event = NewOutboxEvent::notification_trigger(&reminder())
            .unwrap()
            .into_event(1, now);
        assert!(event.is_claimable(now));

        event.locked_until = Some(now + chrono::Duration::seconds(30));
        assert!(!event.is_claimable(now));
        assert!(event.is_claimable(now + chrono::Duration::seconds(31)));

        event.status = OutboxStatus::Sent;
        assert!(!event.is_claimable(now + chrono::Duration::seconds(31)));
    }
}
