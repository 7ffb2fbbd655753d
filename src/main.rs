//! reminder-relay entry point.
//!
//! Loads `.env`, parses configuration, initializes logging and runs the
//! selected workers until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use reminder_relay::bus::{InMemoryBroker, Publisher, Subscriber};
use reminder_relay::config::{BrokerBackend, Cli, Command, RelayConfig};
use reminder_relay::notification::{ConsumerStats, LogNotifier, NotificationConsumer};
use reminder_relay::store::{EventStore, InMemoryEventStore};
use reminder_relay::worker::{spawn_periodic, Shutdown, WorkerHandle};
use reminder_relay::{logging, DueScanner, OutboxRelay};

struct Broker {
    publisher: Option<Arc<dyn Publisher>>,
    subscriber: Option<Arc<dyn Subscriber>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal outside local development.
    let _ = dotenvy::dotenv();

    let config = RelayConfig::from(Cli::parse());
    logging::init(&config.app_env);

    info!(
        command = ?config.command,
        broker = ?config.broker_backend,
        interval = ?config.interval,
        "starting reminder relay"
    );

    let runs_relay = matches!(config.command, Command::Relay | Command::All);
    let runs_consumer = matches!(config.command, Command::Notify | Command::All);

    let broker = open_broker(&config, runs_relay, runs_consumer).await?;
    let shutdown = Shutdown::new();
    let mut workers: Vec<WorkerHandle> = Vec::new();
    let mut consumer: Option<JoinHandle<ConsumerStats>> = None;

    if let Some(publisher) = broker.publisher {
        let store = open_store(&config).await?;

        let scanner =
            DueScanner::new(Arc::clone(&store)).with_batch_size(config.due_scan_batch_size);
        workers.push(spawn_periodic(scanner, config.interval, shutdown.signal()));

        let relay = OutboxRelay::new(store, publisher, config.topics.clone())
            .with_batch_size(config.outbox_batch_size)
            .with_max_attempts(config.outbox_max_attempts);
        workers.push(spawn_periodic(relay, config.interval, shutdown.signal()));
    }

    if let Some(subscriber) = broker.subscriber {
        let consumer_task = NotificationConsumer::new(subscriber, Arc::new(LogNotifier::new()));
        let signal = shutdown.signal();
        consumer = Some(tokio::spawn(async move { consumer_task.run(signal).await }));
        info!(
            topic = %config.topics.notifications,
            group = %config.group_id,
            "notification consumer running"
        );
    }

    wait_for_signal().await?;
    info!(grace = ?config.shutdown_grace, "shutting down");
    shutdown.trigger();

    // One grace period for everything, not one per task.
    let deadline = Instant::now() + config.shutdown_grace;
    for worker in workers {
        let name = worker.name();
        if let Some(stats) = worker.join_until(deadline).await {
            info!(
                worker = name,
                ticks = stats.ticks,
                processed = stats.processed,
                failed = stats.failed,
                "worker finished"
            );
        }
    }
    if let Some(mut handle) = consumer {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(stats)) => info!(
                received = stats.received,
                delivered = stats.delivered,
                "consumer finished"
            ),
            Ok(Err(err)) => warn!(error = %err, "consumer task did not exit cleanly"),
            Err(_) => {
                warn!("grace period elapsed, aborting consumer");
                handle.abort();
            }
        }
    }

    info!("reminder relay stopped");
    Ok(())
}

async fn open_store(config: &RelayConfig) -> Result<Arc<dyn EventStore>> {
    match &config.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let store = reminder_relay::store::PgEventStore::connect(url)
                .await
                .context("failed to open postgres event store")?;
            info!("using postgres event store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => anyhow::bail!("DATABASE_URL is set but this build has no postgres support"),
        None => {
            warn!("DATABASE_URL not set, event store lives in memory");
            Ok(Arc::new(InMemoryEventStore::new()))
        }
    }
}

async fn open_broker(config: &RelayConfig, publish: bool, consume: bool) -> Result<Broker> {
    match config.broker_backend {
        BrokerBackend::Memory => {
            if !(publish && consume) {
                warn!("in-memory broker only connects workers running in this process");
            }
            let broker = InMemoryBroker::new();
            let subscriber: Option<Arc<dyn Subscriber>> = if consume {
                Some(Arc::new(broker.subscriber(
                    config.topics.notifications.clone(),
                    config.group_id.clone(),
                )))
            } else {
                None
            };
            let publisher: Option<Arc<dyn Publisher>> =
                if publish { Some(Arc::new(broker)) } else { None };
            Ok(Broker {
                publisher,
                subscriber,
            })
        }
        #[cfg(feature = "redis-streams")]
        BrokerBackend::RedisStreams => {
            use reminder_relay::bus::RedisStreamBroker;

            let url = config.redis_url();
            let publisher: Option<Arc<dyn Publisher>> = if publish {
                let broker = RedisStreamBroker::connect(&url)
                    .await
                    .with_context(|| format!("failed to connect to {url}"))?
                    .with_max_len(config.stream_max_len);
                Some(Arc::new(broker))
            } else {
                None
            };
            let subscriber: Option<Arc<dyn Subscriber>> = if consume {
                let subscriber = RedisStreamBroker::subscriber(
                    &url,
                    config.topics.notifications.clone(),
                    config.group_id.clone(),
                    config.consumer_name.clone(),
                )
                .await
                .with_context(|| format!("failed to join group {} on {url}", config.group_id))?;
                Some(Arc::new(subscriber))
            } else {
                None
            };
            info!(
                url = %url,
                consumer = %config.consumer_name,
                max_len = ?config.stream_max_len,
                "using redis streams broker"
            );
            Ok(Broker {
                publisher,
                subscriber,
            })
        }
        #[cfg(not(feature = "redis-streams"))]
        BrokerBackend::RedisStreams => anyhow::bail!("this build has no redis-streams support"),
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    Ok(())
}
