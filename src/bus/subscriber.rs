//! Grouped consumer side of the broker bus.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use super::publisher::{Message, PublishError};

/// Broker-native position of a delivered message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Position {
    /// Offset within a partition log.
    Offset(u64),
    /// Redis stream entry id.
    StreamId(String),
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Offset(offset) => write!(f, "{offset}"),
            Position::StreamId(id) => f.write_str(id),
        }
    }
}

/// A message handed to a consumer group member.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub position: Position,
    pub message: Message,
}

/// Consumer-group member reading one topic.
///
/// Delivery is at-least-once: a message counts as consumed once its
/// position is committed, whatever happened to it downstream.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Wait up to `timeout` for the next message.
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, PublishError>;

    /// Commit the group's position past `delivery`.
    async fn commit(&self, delivery: &Delivery) -> Result<(), PublishError>;
}
