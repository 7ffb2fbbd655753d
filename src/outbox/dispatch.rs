use thiserror::Error;

use crate::bus::{Message, PublishError, Publisher};
use crate::model::{EventType, LifecycleEvent, OutboxEvent, ReminderMessage};

pub const DEFAULT_LIFECYCLE_TOPIC: &str = "reminders_lifecycle";
pub const DEFAULT_NOTIFICATIONS_TOPIC: &str = "notifications";

/// Destination topics of the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    pub lifecycle: String,
    pub notifications: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            lifecycle: DEFAULT_LIFECYCLE_TOPIC.to_string(),
            notifications: DEFAULT_NOTIFICATIONS_TOPIC.to_string(),
        }
    }
}

impl Topics {
    pub fn new(lifecycle: impl Into<String>, notifications: impl Into<String>) -> Self {
        Self {
            lifecycle: lifecycle.into(),
            notifications: notifications.into(),
        }
    }

    pub fn for_event(&self, event_type: EventType) -> &str {
        match event_type {
            EventType::Created
            | EventType::Updated
            | EventType::Deleted
            | EventType::NotificationSent => &self.lifecycle,
            EventType::NotificationTrigger => &self.notifications,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The stored payload does not match its event type. Retrying cannot help.
    #[error("event {id}: undecodable {event_type} payload: {source}")]
    Decode {
        id: i64,
        event_type: EventType,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl DispatchError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, DispatchError::Decode { .. })
    }
}

/// Decode `event` into its wire body and address it.
///
/// Returns the destination topic and a message keyed by the owner's id.
pub fn route<'t>(
    event: &OutboxEvent,
    topics: &'t Topics,
) -> Result<(&'t str, Message), DispatchError> {
    let decode_err = |source| DispatchError::Decode {
        id: event.id,
        event_type: event.event_type,
        source,
    };
    let id = event.id.to_string();
    let key = event.user_id.to_string();
    let event_type = event.event_type.as_str();

    let message = match event.event_type {
        EventType::Created
        | EventType::Updated
        | EventType::Deleted
        | EventType::NotificationSent => {
            let body: LifecycleEvent =
                serde_json::from_slice(&event.payload).map_err(decode_err)?;
            Message::json(id, key, event_type, &body)?
        }
        EventType::NotificationTrigger => {
            let body: ReminderMessage =
                serde_json::from_slice(&event.payload).map_err(decode_err)?;
            Message::json(id, key, event_type, &body)?
        }
    };

    Ok((topics.for_event(event.event_type), message))
}

/// Route and publish one event.
pub async fn dispatch<P>(
    publisher: &P,
    topics: &Topics,
    event: &OutboxEvent,
) -> Result<(), DispatchError>
where
    P: Publisher + ?Sized,
{
    let (topic, message) = route(event, topics)?;
    publisher.publish(topic, message).await?;
    Ok(())
}
