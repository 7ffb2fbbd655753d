use chrono::Utc;
use reminder_relay::{EventStore, OutboxStatus, ReminderMessage};

use super::support::Pipeline;

#[tokio::test]
async fn broker_outage_counts_retries_then_delivers() {
    let pipeline = Pipeline::new();
    let reminder = pipeline
        .reminder(3, "renew passport", Utc::now() - chrono::Duration::seconds(5))
        .await;
    // Ship the created event first so only the trigger is pending.
    pipeline.relay.relay_once().await.unwrap();
    pipeline.scanner.scan_once(Utc::now()).await.unwrap();

    const OUTAGE: usize = 4;
    pipeline.publisher.fail_next(OUTAGE);
    for tick in 1..=OUTAGE {
        let stats = pipeline.relay.relay_once().await.unwrap();
        assert_eq!(stats.retried, 1, "tick {tick}");

        let mut events = pipeline.store.events_for_aggregate(reminder.id).await.unwrap();
        let trigger = events.pop().unwrap();
        assert!(trigger.is_pending());
        assert_eq!(trigger.retry_count as usize, tick);
        assert!(trigger.last_error.unwrap().contains("connection refused"));
    }
    assert!(pipeline.broker.is_empty("notifications"));

    let stats = pipeline.relay.relay_once().await.unwrap();
    assert_eq!(stats.published, 1);

    let trigger = pipeline.store.events_for_aggregate(reminder.id).await.unwrap().pop().unwrap();
    assert_eq!(trigger.status, OutboxStatus::Sent);
    assert_eq!(trigger.retry_count as usize, OUTAGE);

    let published = pipeline.broker.messages("notifications");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].decode::<ReminderMessage>().unwrap().id, reminder.id);
}

#[tokio::test]
async fn failed_event_does_not_block_later_ones() {
    let pipeline = Pipeline::new();
    pipeline.reminder(1, "first", Utc::now() + chrono::Duration::hours(1)).await;
    pipeline.reminder(2, "second", Utc::now() + chrono::Duration::hours(1)).await;

    pipeline.publisher.fail_next(1);
    let stats = pipeline.relay.relay_once().await.unwrap();

    assert_eq!(stats.claimed, 2);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.published, 1);
    assert_eq!(pipeline.broker.messages_for_key("reminders_lifecycle", "2").len(), 1);

    pipeline.relay.relay_once().await.unwrap();
    assert_eq!(pipeline.broker.len("reminders_lifecycle"), 2);
    assert!(pipeline.store.events_with_status(OutboxStatus::Pending).unwrap().is_empty());
}

#[tokio::test]
async fn retry_cap_parks_event_as_failed() {
    let mut pipeline = Pipeline::new();
    let reminder = pipeline.reminder(8, "capped", Utc::now() + chrono::Duration::hours(1)).await;
    pipeline.relay = pipeline.relay.with_max_attempts(Some(3));

    pipeline.publisher.fail_next(usize::MAX);
    let mut dead = 0;
    for _ in 0..5 {
        dead += pipeline.relay.relay_once().await.unwrap().dead_lettered;
    }

    assert_eq!(dead, 1);
    assert_eq!(pipeline.publisher.attempts(), 3);
    let event = &pipeline.store.events_for_aggregate(reminder.id).await.unwrap()[0];
    assert_eq!(event.status, OutboxStatus::Failed);
    assert_eq!(event.retry_count, 3);
}
