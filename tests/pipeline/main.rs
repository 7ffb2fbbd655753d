//! Pipeline Tests
//!
//! Drives the store, the due scanner, the outbox relay and the notification
//! consumer together over the in-memory store and broker.
//!
//! ```text
//!  create/update/delete ─► InMemoryEventStore ◄─ DueScanner
//!                               │
//!                          OutboxRelay
//!                               │
//!                        InMemoryBroker (keyed partitions)
//!                               │
//!                    NotificationConsumer ─► LogNotifier
//! ```

mod delivery;
mod ordering;
mod retry;
mod support;
