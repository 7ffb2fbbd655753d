//! Redis Streams broker.
//!
//! One stream per topic. A stream is totally ordered, so messages sharing a
//! key are read back in publish order. Consumer groups map onto
//! `XGROUP`/`XREADGROUP`/`XACK`.
//!
//! A subscriber first re-reads its own pending entries (delivered to this
//! consumer name but never acked), then switches to new entries. Consumer
//! names must therefore survive restarts.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use super::{Delivery, Message, Position, PublishError, Publisher, Subscriber};

const FIELD_ID: &str = "id";
const FIELD_KEY: &str = "key";
const FIELD_TYPE: &str = "event_type";
const FIELD_PAYLOAD: &str = "payload";

async fn connect(redis_url: &str) -> Result<ConnectionManager, PublishError> {
    let client = redis::Client::open(redis_url)
        .map_err(|e| PublishError::ConnectionFailed(e.to_string()))?;
    ConnectionManager::new(client)
        .await
        .map_err(|e| PublishError::ConnectionFailed(e.to_string()))
}

/// `XADD` for one message. With `max_len` the stream is trimmed to roughly
/// that many entries (`MAXLEN ~`).
fn xadd_cmd(topic: &str, message: &Message, max_len: Option<usize>) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(topic);
    if let Some(max_len) = max_len {
        cmd.arg("MAXLEN").arg("~").arg(max_len);
    }
    cmd.arg("*")
        .arg(FIELD_ID)
        .arg(&message.id)
        .arg(FIELD_KEY)
        .arg(&message.key)
        .arg(FIELD_TYPE)
        .arg(&message.event_type)
        .arg(FIELD_PAYLOAD)
        .arg(&message.payload);
    cmd
}

fn to_delivery(topic: &str, entry: &StreamId) -> Result<Delivery, PublishError> {
    let field = |name: &str| -> Result<String, PublishError> {
        entry.get::<String>(name).ok_or_else(|| {
            PublishError::Rejected(format!("stream entry {} lacks field {name}", entry.id))
        })
    };
    let payload: Vec<u8> = entry.get(FIELD_PAYLOAD).ok_or_else(|| {
        PublishError::Rejected(format!("stream entry {} lacks payload", entry.id))
    })?;

    Ok(Delivery {
        topic: topic.to_string(),
        partition: 0,
        position: Position::StreamId(entry.id.clone()),
        message: Message::new(field(FIELD_ID)?, field(FIELD_KEY)?, field(FIELD_TYPE)?, payload),
    })
}

/// Where the next `XREADGROUP` starts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadCursor {
    /// Walking this consumer's pending entries, after the given id.
    Pending(String),
    /// Pending list drained; reading new entries (`>`).
    Live,
}

impl ReadCursor {
    fn start() -> Self {
        ReadCursor::Pending("0".to_string())
    }

    fn read_id(&self) -> &str {
        match self {
            ReadCursor::Pending(id) => id,
            ReadCursor::Live => ">",
        }
    }

    fn is_live(&self) -> bool {
        matches!(self, ReadCursor::Live)
    }

    /// Move past the entry a read returned, or go live once a pending read
    /// comes back empty.
    fn advance(&mut self, last: Option<&str>) {
        if let ReadCursor::Pending(_) = self {
            *self = match last {
                Some(id) => ReadCursor::Pending(id.to_string()),
                None => ReadCursor::Live,
            };
        }
    }
}

/// Producer writing each topic to a Redis stream.
#[derive(Clone)]
pub struct RedisStreamBroker {
    redis: ConnectionManager,
    max_len: Option<usize>,
}

impl RedisStreamBroker {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self, PublishError> {
        Ok(Self {
            redis: connect(redis_url).await?,
            max_len: None,
        })
    }

    /// Trim every stream to about `max_len` entries on publish. `None`
    /// keeps streams unbounded.
    pub fn with_max_len(mut self, max_len: Option<usize>) -> Self {
        self.max_len = max_len.filter(|len| *len > 0);
        self
    }

    /// Join `group` on `topic` as `consumer`, creating the stream and the
    /// group when missing. A new group starts at the beginning of the stream.
    ///
    /// The subscriber gets its own connection because `XREADGROUP BLOCK`
    /// holds the connection for the whole wait.
    pub async fn subscriber(
        redis_url: &str,
        topic: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<RedisStreamSubscriber, PublishError> {
        let mut redis = connect(redis_url).await?;
        let topic = topic.into();
        let group = group.into();

        let created: Result<(), redis::RedisError> =
            redis.xgroup_create_mkstream(&topic, &group, "0").await;
        match created {
            Ok(()) => debug!(topic = %topic, group = %group, "created consumer group"),
            Err(err) if err.code() == Some("BUSYGROUP") => {}
            Err(err) => return Err(err.into()),
        }

        Ok(RedisStreamSubscriber {
            redis,
            topic,
            group,
            consumer: consumer.into(),
            cursor: Mutex::new(ReadCursor::start()),
        })
    }
}

#[async_trait]
impl Publisher for RedisStreamBroker {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), PublishError> {
        let mut conn = self.redis.clone();
        let _entry: String = xadd_cmd(topic, &message, self.max_len)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Consumer-group member reading one Redis stream.
pub struct RedisStreamSubscriber {
    redis: ConnectionManager,
    topic: String,
    group: String,
    consumer: String,
    cursor: Mutex<ReadCursor>,
}

impl RedisStreamSubscriber {
    fn cursor(&self) -> std::sync::MutexGuard<'_, ReadCursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Subscriber for RedisStreamSubscriber {
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, PublishError> {
        let cursor = self.cursor().clone();
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1);
        if cursor.is_live() {
            options = options.block(timeout.as_millis().max(1) as usize);
        }

        let mut conn = self.redis.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.topic], &[cursor.read_id()], &options)
            .await?;

        let entry = reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .next();

        {
            let mut current = self.cursor();
            if *current == cursor {
                current.advance(entry.as_ref().map(|entry| entry.id.as_str()));
                if !cursor.is_live() && current.is_live() {
                    info!(
                        topic = %self.topic,
                        consumer = %self.consumer,
                        "pending entries drained"
                    );
                }
            }
        }

        let Some(entry) = entry else {
            return Ok(None);
        };
        match to_delivery(&self.topic, &entry) {
            Ok(delivery) => Ok(Some(delivery)),
            Err(err) => {
                // A trimmed or foreign entry can never be delivered; ack it
                // so it stops coming back with every pending read.
                let _acked: i64 = conn.xack(&self.topic, &self.group, &[&entry.id]).await?;
                Err(err)
            }
        }
    }

    async fn commit(&self, delivery: &Delivery) -> Result<(), PublishError> {
        let Position::StreamId(id) = &delivery.position else {
            return Err(PublishError::Rejected(format!(
                "foreign position {} for stream {}",
                delivery.position, self.topic
            )));
        };
        let mut conn = self.redis.clone();
        let acked: Result<i64, redis::RedisError> =
            conn.xack(&self.topic, &self.group, &[id]).await;
        if let Err(err) = acked {
            // The entry stays pending; walk the pending list again.
            warn!(topic = %self.topic, id = %id, "ack failed, re-reading pending entries");
            *self.cursor() = ReadCursor::start();
            return Err(err.into());
        }
        Ok(())
    }
}
