//! Shared fixtures for the pipeline suite.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reminder_relay::bus::{InMemoryBroker, Message, PublishError, Publisher};
use reminder_relay::{
    DueScanner, EventStore, InMemoryEventStore, NewReminder, OutboxRelay, Reminder, Topics,
};

/// Publisher that refuses the next `outage` publishes, then forwards to an
/// in-memory broker.
#[derive(Default)]
pub struct FlakyPublisher {
    pub broker: InMemoryBroker,
    outage: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyPublisher {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            outage: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` publishes.
    pub fn fail_next(&self, count: usize) {
        self.outage.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for FlakyPublisher {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let down = self
            .outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if down {
            return Err(PublishError::ConnectionFailed("kafka: connection refused".into()));
        }
        self.broker.publish(topic, message).await
    }
}

/// Store, broker and both periodic workers wired together.
pub struct Pipeline {
    pub store: InMemoryEventStore,
    pub broker: InMemoryBroker,
    pub publisher: Arc<FlakyPublisher>,
    pub scanner: DueScanner<InMemoryEventStore>,
    pub relay: OutboxRelay<InMemoryEventStore, FlakyPublisher>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_partitions(3)
    }

    pub fn with_partitions(partitions: u32) -> Self {
        let store = InMemoryEventStore::new();
        let broker = InMemoryBroker::with_partitions(partitions);
        let publisher = Arc::new(FlakyPublisher::new(broker.clone()));
        let shared = Arc::new(store.clone());

        Self {
            scanner: DueScanner::new(Arc::clone(&shared)),
            relay: OutboxRelay::new(shared, Arc::clone(&publisher), Topics::default())
                .with_worker_id("relay-1"),
            store,
            broker,
            publisher,
        }
    }

    pub async fn reminder(&self, user_id: i64, title: &str, due_at: DateTime<Utc>) -> Reminder {
        self.store
            .create_reminder(NewReminder::new(user_id, title, format!("{title} details"), due_at))
            .await
            .unwrap()
    }

    /// One scan followed by one relay pass.
    pub async fn tick(&self) {
        self.scanner.scan_once(Utc::now()).await.unwrap();
        self.relay.relay_once().await.unwrap();
    }
}
