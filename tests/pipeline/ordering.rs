use chrono::Utc;
use reminder_relay::bus::Subscriber;
use reminder_relay::{EventStore, EventType, LifecycleEvent, ReminderUpdate};
use std::time::Duration;

use super::support::Pipeline;

#[tokio::test]
async fn per_key_order_survives_interleaving() {
    let pipeline = Pipeline::with_partitions(4);
    let due = Utc::now() + chrono::Duration::hours(2);

    // A, B and C for user 10, interleaved with writes for other users.
    let a = pipeline.reminder(10, "A", due).await;
    pipeline.reminder(20, "other", due).await;
    pipeline
        .store
        .update_reminder(a.id, ReminderUpdate::default().title("B"))
        .await
        .unwrap();
    pipeline.reminder(30, "another", due).await;
    pipeline.store.delete_reminder(a.id).await.unwrap();

    pipeline.relay.relay_once().await.unwrap();

    let partition = pipeline.broker.partition_for("10");
    let on_partition: Vec<(String, EventType)> = pipeline
        .broker
        .partition_messages("reminders_lifecycle", partition)
        .into_iter()
        .filter(|m| m.key == "10")
        .map(|m| {
            let body: LifecycleEvent = m.decode().unwrap();
            (m.key, body.event_type)
        })
        .collect();

    assert_eq!(
        on_partition,
        vec![
            ("10".to_string(), EventType::Created),
            ("10".to_string(), EventType::Updated),
            ("10".to_string(), EventType::Deleted),
        ]
    );
}

#[tokio::test]
async fn failed_head_holds_back_the_rest_of_its_key() {
    let pipeline = Pipeline::with_partitions(1);
    let due = Utc::now() + chrono::Duration::hours(2);
    let reminder = pipeline.reminder(10, "A", due).await;
    pipeline
        .store
        .update_reminder(reminder.id, ReminderUpdate::default().title("B"))
        .await
        .unwrap();
    pipeline.store.delete_reminder(reminder.id).await.unwrap();

    // Created fails; updated and deleted sit in the same batch behind it.
    pipeline.publisher.fail_next(1);
    let first = pipeline.relay.relay_once().await.unwrap();
    assert_eq!(first.claimed, 3);
    assert_eq!(first.retried, 1);
    assert_eq!(first.deferred, 2);
    assert_eq!(first.published, 0);
    assert!(pipeline.broker.is_empty("reminders_lifecycle"));

    let second = pipeline.relay.relay_once().await.unwrap();
    assert_eq!(second.published, 3);

    let kinds: Vec<EventType> = pipeline
        .broker
        .messages_for_key("reminders_lifecycle", "10")
        .iter()
        .map(|m| m.decode::<LifecycleEvent>().unwrap().event_type)
        .collect();
    assert_eq!(kinds, vec![EventType::Created, EventType::Updated, EventType::Deleted]);

    // Deferred events were released, not charged a retry.
    let events = pipeline.store.events_for_aggregate(reminder.id).await.unwrap();
    let retries: Vec<u32> = events.iter().map(|e| e.retry_count).collect();
    assert_eq!(retries, vec![1, 0, 0]);
}

#[tokio::test]
async fn consumer_group_reads_key_in_order() {
    let pipeline = Pipeline::with_partitions(2);
    let past = Utc::now() - chrono::Duration::minutes(1);
    for title in ["one", "two", "three"] {
        pipeline.reminder(5, title, past).await;
    }
    pipeline.tick().await;

    let subscriber = pipeline.broker.subscriber("notifications", "notification-workers");
    let mut titles = Vec::new();
    while let Some(delivery) = subscriber.poll(Duration::from_millis(10)).await.unwrap() {
        subscriber.commit(&delivery).await.unwrap();
        let body: reminder_relay::ReminderMessage = delivery.message.decode().unwrap();
        titles.push(body.title);
    }

    assert_eq!(titles, vec!["one", "two", "three"]);
}
