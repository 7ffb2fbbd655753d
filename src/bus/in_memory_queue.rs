//! In-memory partitioned broker for tests and single-process deployments.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Delivery, Message, Position, PublishError, Publisher, Subscriber};

const DEFAULT_PARTITIONS: u32 = 3;
const POLL_STEP: Duration = Duration::from_millis(5);

#[derive(Default)]
struct BrokerState {
    /// topic -> partition logs
    topics: HashMap<String, Vec<Vec<Message>>>,
    /// (topic, group) -> next offset to read, per partition
    committed: HashMap<(String, String), Vec<u64>>,
}

/// In-memory broker with keyed partitions and consumer groups.
///
/// - every topic is split into a fixed number of append-only partition logs
/// - a message's partition is derived from its key, so one key always lands
///   on one partition and keeps its publish order
/// - consumer groups remember committed offsets; a new subscriber for a
///   group resumes after the last commit
///
/// ## Example
///
/// ```
/// use reminder_relay::bus::{InMemoryBroker, Message, Publisher, Subscriber};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let broker = InMemoryBroker::new();
/// broker
///     .publish("notifications", Message::new("1", "42", "notification_trigger", b"{}".to_vec()))
///     .await
///     .unwrap();
///
/// let consumer = broker.subscriber("notifications", "notification-workers");
/// let delivery = consumer.poll(Duration::from_millis(10)).await.unwrap().unwrap();
/// assert_eq!(delivery.message.key, "42");
/// consumer.commit(&delivery).await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<RwLock<BrokerState>>,
    partitions: u32,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            state: Arc::new(RwLock::new(BrokerState::default())),
            partitions: partitions.max(1),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partitions)) as u32
    }

    /// New member of `group` reading `topic`, starting at the group's
    /// committed offsets.
    pub fn subscriber(
        &self,
        topic: impl Into<String>,
        group: impl Into<String>,
    ) -> InMemorySubscriber {
        let topic = topic.into();
        let group = group.into();
        let next = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state
                .committed
                .entry((topic.clone(), group.clone()))
                .or_insert_with(|| vec![0; self.partitions as usize])
                .clone()
        };
        InMemorySubscriber {
            broker: self.clone(),
            topic,
            group,
            next: Mutex::new(next),
            cursor: Mutex::new(0),
        }
    }

    /// Every message on `topic`, partition by partition.
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn partition_messages(&self, topic: &str, partition: u32) -> Vec<Message> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Messages carrying `key`, in the order the broker stored them.
    pub fn messages_for_key(&self, topic: &str, key: &str) -> Vec<Message> {
        self.partition_messages(topic, self.partition_for(key))
            .into_iter()
            .filter(|m| m.key == key)
            .collect()
    }

    pub fn len(&self, topic: &str) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Committed next-offsets of `group` on `topic`, per partition.
    pub fn committed(&self, topic: &str, group: &str) -> Vec<u64> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .committed
            .get(&(topic.to_string(), group.to_string()))
            .cloned()
            .unwrap_or_else(|| vec![0; self.partitions as usize])
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), PublishError> {
        let partition = self.partition_for(&message.key) as usize;
        let mut state = self
            .state
            .write()
            .map_err(|_| PublishError::Rejected("broker state poisoned".into()))?;
        let logs = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.partitions as usize]);
        logs[partition].push(message);
        Ok(())
    }
}

/// One consumer-group member of an [`InMemoryBroker`] topic.
///
/// Partitions are read round-robin so one busy key cannot starve the rest.
pub struct InMemorySubscriber {
    broker: InMemoryBroker,
    topic: String,
    group: String,
    next: Mutex<Vec<u64>>,
    cursor: Mutex<usize>,
}

impl InMemorySubscriber {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn try_next(&self) -> Result<Option<Delivery>, PublishError> {
        let state = self
            .broker
            .state
            .read()
            .map_err(|_| PublishError::Rejected("broker state poisoned".into()))?;
        let Some(logs) = state.topics.get(&self.topic) else {
            return Ok(None);
        };

        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let count = logs.len();

        for step in 0..count {
            let partition = (*cursor + step) % count;
            let offset = next[partition];
            if let Some(message) = logs[partition].get(offset as usize) {
                next[partition] = offset + 1;
                *cursor = (partition + 1) % count;
                return Ok(Some(Delivery {
                    topic: self.topic.clone(),
                    partition: partition as u32,
                    position: Position::Offset(offset),
                    message: message.clone(),
                }));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl Subscriber for InMemorySubscriber {
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, PublishError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(delivery) = self.try_next()? {
                return Ok(Some(delivery));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(POLL_STEP.min(remaining)).await;
        }
    }

    async fn commit(&self, delivery: &Delivery) -> Result<(), PublishError> {
        let Position::Offset(offset) = &delivery.position else {
            return Err(PublishError::Rejected(format!(
                "foreign position {} for in-memory topic {}",
                delivery.position, self.topic
            )));
        };
        let mut state = self
            .broker
            .state
            .write()
            .map_err(|_| PublishError::Rejected("broker state poisoned".into()))?;
        let partitions = self.broker.partitions as usize;
        let committed = state
            .committed
            .entry((self.topic.clone(), self.group.clone()))
            .or_insert_with(|| vec![0; partitions]);
        let slot = committed
            .get_mut(delivery.partition as usize)
            .ok_or_else(|| PublishError::Rejected(format!("no partition {}", delivery.partition)))?;
        *slot = (*slot).max(*offset + 1);
        Ok(())
    }
}
