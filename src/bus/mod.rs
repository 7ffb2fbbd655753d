//! Broker bus - keyed publish and grouped consume.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Publisher: publish(topic, message)                      │
//! │  Subscriber: poll(timeout) / commit(delivery)            │
//! └──────────────────────────────────────────────────────────┘
//!          │                              │
//!          ▼                              ▼
//! ┌──────────────────┐        ┌──────────────────────────┐
//! │ InMemoryBroker   │        │ RedisStreamBroker        │
//! │ keyed partitions │        │ one stream per topic     │
//! └──────────────────┘        └──────────────────────────┘
//! ```
//!
//! The outbox relay only publishes; the notification consumer only
//! subscribes. Both see the broker through these two traits.

mod in_memory_queue;
mod publisher;
#[cfg(feature = "redis-streams")]
mod redis_stream;
mod subscriber;

pub use in_memory_queue::{InMemoryBroker, InMemorySubscriber};
pub use publisher::{Message, PublishError, Publisher};
#[cfg(feature = "redis-streams")]
pub use redis_stream::{RedisStreamBroker, RedisStreamSubscriber};
pub use subscriber::{Delivery, Position, Subscriber};
