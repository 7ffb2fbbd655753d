//! Keyed producer side of the broker bus.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// A message published to a topic.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Identifier of the outbox event the message was produced from.
    pub id: String,
    /// Partition key; messages sharing a key keep their publish order.
    pub key: String,
    pub event_type: String,
    /// Serialized JSON body.
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        key: impl Into<String>,
        event_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Build a message with a JSON-encoded body.
    pub fn json<T: Serialize>(
        id: impl Into<String>,
        key: impl Into<String>,
        event_type: impl Into<String>,
        body: &T,
    ) -> Result<Self, PublishError> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        Ok(Self::new(id, key, event_type, payload))
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("message rejected: {0}")]
    Rejected(String),

    #[cfg(feature = "redis-streams")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Producer half of the broker.
///
/// `publish` resolves only once the broker accepted or refused the message,
/// so callers can branch on the outcome.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), PublishError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_construction() {
        let message = Message::new("evt-1", "42", "created", b"{}".to_vec());

        assert_eq!(message.id, "evt-1");
        assert_eq!(message.key, "42");
        assert_eq!(message.event_type, "created");
        assert_eq!(message.payload_str(), Some("{}"));
    }

    #[test]
    fn json_message_decodes_back() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Body {
            id: i64,
        }

        let message = Message::json("evt-1", "7", "notification_trigger", &Body { id: 3 }).unwrap();
        assert_eq!(message.decode::<Body>().unwrap(), Body { id: 3 });
    }
}
