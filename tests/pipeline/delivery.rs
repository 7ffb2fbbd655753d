use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reminder_relay::bus::Subscriber;
use reminder_relay::{
    DueScanner, EventStore, EventType, LifecycleEvent, LogNotifier, NotificationConsumer,
    OutboxStatus, ReminderMessage, ReminderStatus, Shutdown,
};

use super::support::Pipeline;

fn triggers(pipeline: &Pipeline) -> usize {
    pipeline
        .store
        .outbox()
        .unwrap()
        .iter()
        .filter(|e| e.event_type == EventType::NotificationTrigger)
        .count()
}

#[tokio::test]
async fn due_reminder_emits_exactly_one_trigger() {
    let pipeline = Pipeline::new();
    let reminder = pipeline
        .reminder(42, "pay rent", Utc::now() - chrono::Duration::seconds(1))
        .await;

    let stats = pipeline.scanner.scan_once(Utc::now()).await.unwrap();
    assert_eq!(stats.triggered, 1);
    assert_eq!(triggers(&pipeline), 1);

    let again = pipeline.scanner.scan_once(Utc::now()).await.unwrap();
    assert_eq!(again.found, 0);
    assert_eq!(triggers(&pipeline), 1);

    let stored = pipeline.store.get_reminder(reminder.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ReminderStatus::Sent);
}

#[tokio::test]
async fn restarted_scanner_does_not_trigger_twice() {
    let pipeline = Pipeline::new();
    pipeline
        .reminder(1, "standup", Utc::now() - chrono::Duration::minutes(2))
        .await;
    pipeline.scanner.scan_once(Utc::now()).await.unwrap();

    // A fresh scanner over the same store, as after a process restart.
    let restarted = DueScanner::new(Arc::new(pipeline.store.clone()));
    let stats = restarted.scan_once(Utc::now()).await.unwrap();

    assert_eq!(stats.triggered, 0);
    assert_eq!(triggers(&pipeline), 1);
}

#[tokio::test]
async fn sent_event_is_never_published_again() {
    let pipeline = Pipeline::new();
    pipeline.reminder(5, "gym", Utc::now() + chrono::Duration::hours(1)).await;

    for _ in 0..3 {
        pipeline.tick().await;
    }

    assert_eq!(pipeline.publisher.attempts(), 1);
    assert_eq!(pipeline.broker.len("reminders_lifecycle"), 1);
    let sent = pipeline.store.events_with_status(OutboxStatus::Sent).unwrap();
    assert_eq!(sent.len(), 1);
}

#[tokio::test]
async fn lifecycle_events_reach_the_lifecycle_topic() {
    let pipeline = Pipeline::new();
    let reminder = pipeline.reminder(9, "draft", Utc::now() + chrono::Duration::days(1)).await;
    pipeline
        .store
        .update_reminder(reminder.id, reminder_relay::ReminderUpdate::default().title("final"))
        .await
        .unwrap();
    pipeline.store.delete_reminder(reminder.id).await.unwrap();

    pipeline.tick().await;

    let kinds: Vec<EventType> = pipeline
        .broker
        .messages_for_key("reminders_lifecycle", "9")
        .iter()
        .map(|m| m.decode::<LifecycleEvent>().unwrap().event_type)
        .collect();
    assert_eq!(kinds, vec![EventType::Created, EventType::Updated, EventType::Deleted]);
    assert!(pipeline.broker.is_empty("notifications"));
}

#[tokio::test]
async fn end_to_end_notification() {
    let pipeline = Pipeline::new();
    let reminder = pipeline
        .reminder(77, "take pills", Utc::now() - chrono::Duration::seconds(1))
        .await;

    pipeline.scanner.scan_once(Utc::now()).await.unwrap();
    let pending = pipeline.store.events_with_status(OutboxStatus::Pending).unwrap();
    assert_eq!(
        pending.iter().filter(|e| e.event_type == EventType::NotificationTrigger).count(),
        1
    );

    pipeline.relay.relay_once().await.unwrap();
    assert!(pipeline.store.events_with_status(OutboxStatus::Pending).unwrap().is_empty());

    let published = pipeline.broker.messages("notifications");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, "77");
    let body: ReminderMessage = published[0].decode().unwrap();
    assert_eq!(body.id, reminder.id);
    assert_eq!(body.title, "take pills");
    assert_eq!(body.description, "take pills details");

    let subscriber = Arc::new(pipeline.broker.subscriber("notifications", "notification-workers"));
    let notifier = Arc::new(LogNotifier::capturing());
    let consumer = NotificationConsumer::new(Arc::clone(&subscriber), Arc::clone(&notifier))
        .with_poll_timeout(Duration::from_millis(20));

    let shutdown = Shutdown::new();
    let signal = shutdown.signal();
    let task = tokio::spawn(async move { consumer.run(signal).await });

    for _ in 0..100 {
        if !notifier.delivered().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.trigger();
    let stats = task.await.unwrap();

    assert_eq!(stats.delivered, 1);
    let expected = "[NOTIFICATION] Sending reminder to user 77: take pills - take pills details";
    assert_eq!(notifier.delivered(), vec![expected.to_string()]);
    // Committed, so nothing is left for the group.
    assert!(subscriber.poll(Duration::from_millis(10)).await.unwrap().is_none());
}
