use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::dispatch::{dispatch, DispatchError, Topics};
use crate::bus::Publisher;
use crate::error::StoreError;
use crate::model::OutboxEvent;
use crate::store::EventStore;
use crate::worker::{Periodic, TickReport};

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// Result of one relay pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub claimed: usize,
    pub published: usize,
    /// Publish failed; the event stays pending for the next pass.
    pub retried: usize,
    pub dead_lettered: usize,
    /// Held back behind an earlier failed event of the same owner.
    pub deferred: usize,
    /// Outcome could not be written back to the store.
    pub store_errors: usize,
}

/// What happened to a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Published,
    Retried,
    DeadLettered,
}

/// Drains pending outbox events to the broker.
///
/// Events are claimed oldest first and published one at a time, so events
/// sharing an owner reach the broker in the order they were written. Once an
/// owner's event fails in a pass, that owner's later events are released
/// untouched and go out behind it on a later pass.
pub struct OutboxRelay<S: ?Sized, P: ?Sized> {
    store: Arc<S>,
    publisher: Arc<P>,
    topics: Topics,
    worker_id: String,
    batch_size: usize,
    lease: Duration,
    max_attempts: Option<u32>,
}

impl<S: ?Sized, P: ?Sized> OutboxRelay<S, P> {
    pub fn new(store: Arc<S>, publisher: Arc<P>, topics: Topics) -> Self {
        Self {
            store,
            publisher,
            topics,
            worker_id: format!("relay-{}", std::process::id()),
            batch_size: DEFAULT_BATCH_SIZE,
            lease: DEFAULT_LEASE,
            max_attempts: None,
        }
    }

    /// Set the worker id stamped on claimed rows.
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Dead-letter an event once its retry count reaches `max`.
    /// `None` retries forever.
    pub fn with_max_attempts(mut self, max: Option<u32>) -> Self {
        self.max_attempts = max.filter(|max| *max > 0);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

impl<S, P> OutboxRelay<S, P>
where
    S: EventStore + ?Sized,
    P: Publisher + ?Sized,
{
    /// Claim one batch and publish it.
    ///
    /// Fails only when the batch cannot be claimed; per-event problems are
    /// logged and counted.
    pub async fn relay_once(&self) -> Result<RelayStats, StoreError> {
        let events = self
            .store
            .claim_pending(&self.worker_id, self.batch_size, self.lease)
            .await?;

        let mut stats = RelayStats {
            claimed: events.len(),
            ..Default::default()
        };

        // Owners whose head event did not go out in this pass.
        let mut blocked: HashSet<i64> = HashSet::new();

        for event in &events {
            if blocked.contains(&event.user_id) {
                match self.store.release(event.id).await {
                    Ok(()) => stats.deferred += 1,
                    Err(err) => {
                        error!(
                            event_id = event.id,
                            error = %err,
                            "failed to release outbox event"
                        );
                        stats.store_errors += 1;
                    }
                }
                continue;
            }

            match self.process(event).await {
                Ok(Outcome::Published) => stats.published += 1,
                Ok(Outcome::DeadLettered) => stats.dead_lettered += 1,
                Ok(Outcome::Retried) => {
                    stats.retried += 1;
                    blocked.insert(event.user_id);
                }
                Err(err) => {
                    error!(
                        event_id = event.id,
                        error = %err,
                        "failed to record relay outcome"
                    );
                    stats.store_errors += 1;
                    blocked.insert(event.user_id);
                }
            }
        }

        if stats.claimed > 0 {
            info!(
                claimed = stats.claimed,
                published = stats.published,
                retried = stats.retried,
                deferred = stats.deferred,
                dead_lettered = stats.dead_lettered,
                "relayed outbox batch"
            );
        }

        Ok(stats)
    }

    async fn process(&self, event: &OutboxEvent) -> Result<Outcome, StoreError> {
        match dispatch(self.publisher.as_ref(), &self.topics, event).await {
            Ok(()) => {
                self.store.mark_sent(event.id).await?;
                debug!(
                    event_id = event.id,
                    event_type = %event.event_type,
                    user_id = event.user_id,
                    "published outbox event"
                );
                Ok(Outcome::Published)
            }
            Err(err) if err.is_permanent() => {
                let reason = err.to_string();
                self.store.dead_letter(event.id, &reason).await?;
                warn!(event_id = event.id, error = %reason, "dead-lettered outbox event");
                Ok(Outcome::DeadLettered)
            }
            Err(err) => self.retry_or_give_up(event, err).await,
        }
    }

    async fn retry_or_give_up(
        &self,
        event: &OutboxEvent,
        err: DispatchError,
    ) -> Result<Outcome, StoreError> {
        let reason = err.to_string();
        let attempts = self.store.record_failure(event.id, &reason).await?;

        match self.max_attempts {
            Some(max) if attempts >= max => {
                self.store.dead_letter(event.id, &reason).await?;
                warn!(
                    event_id = event.id,
                    attempts,
                    error = %reason,
                    "retry limit reached, dead-lettered outbox event"
                );
                Ok(Outcome::DeadLettered)
            }
            _ => {
                warn!(
                    event_id = event.id,
                    attempts,
                    error = %reason,
                    "publish failed, will retry"
                );
                Ok(Outcome::Retried)
            }
        }
    }
}

#[async_trait]
impl<S, P> Periodic for OutboxRelay<S, P>
where
    S: EventStore + ?Sized + 'static,
    P: Publisher + ?Sized + 'static,
{
    fn name(&self) -> &'static str {
        "outbox-relay"
    }

    async fn tick(&self) -> TickReport {
        match self.relay_once().await {
            Ok(stats) => TickReport {
                processed: stats.published + stats.dead_lettered,
                failed: stats.retried + stats.store_errors,
            },
            Err(err) => {
                warn!(error = %err, "could not claim outbox events");
                TickReport {
                    processed: 0,
                    failed: 1,
                }
            }
        }
    }
}
