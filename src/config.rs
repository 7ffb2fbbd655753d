//! Command line and environment configuration.
//!
//! Every option can be given as a flag or through its environment variable
//! (a `.env` file is loaded first by the binary). Flags win over the
//! environment.

use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use thiserror::Error;

use crate::outbox::{Topics, DEFAULT_LIFECYCLE_TOPIC, DEFAULT_NOTIFICATIONS_TOPIC};

const LONG_ABOUT: &str = "Runs the asynchronous half of the reminder platform.

`relay` drives the due scanner and the outbox relay, `notify` runs the \
notification consumer and `all` runs both in one process (the default).";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid duration {input:?}: {reason}")]
    InvalidDuration { input: String, reason: &'static str },
}

/// Reminder delivery pipeline: outbox relay, due scanner and notification consumer.
#[derive(Parser, Debug)]
#[command(name = "reminder-relay")]
#[command(version)]
#[command(long_about = LONG_ABOUT)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Comma separated broker addresses.
    #[arg(
        long,
        env = "KAFKA_BROKERS",
        default_value = "localhost:6379",
        global = true
    )]
    pub brokers: String,

    /// Topic for created/updated/deleted/notification_sent events.
    #[arg(
        long,
        env = "KAFKA_TOPIC_LIFECYCLE",
        default_value = DEFAULT_LIFECYCLE_TOPIC,
        global = true
    )]
    pub lifecycle_topic: String,

    /// Topic for notification triggers.
    #[arg(
        long,
        env = "KAFKA_TOPIC_NOTIFICATIONS",
        default_value = DEFAULT_NOTIFICATIONS_TOPIC,
        global = true
    )]
    pub notifications_topic: String,

    /// Consumer group of the notification consumer.
    #[arg(
        long,
        env = "KAFKA_GROUP_ID",
        default_value = "notification-workers",
        global = true
    )]
    pub group_id: String,

    /// Name of this process inside the consumer group. Must stay the same
    /// across restarts so unacknowledged messages are picked up again.
    /// Defaults to `<group>-<HOSTNAME>`.
    #[arg(long, env = "CONSUMER_NAME", global = true)]
    pub consumer_name: Option<String>,

    /// Tick period of the due scanner and the outbox relay (e.g. 500ms, 5s, 1m30s).
    #[arg(
        long,
        env = "WORKER_INTERVAL",
        default_value = "5s",
        value_parser = parse_duration,
        global = true
    )]
    pub interval: Duration,

    /// Outbox events relayed per tick.
    #[arg(long, env = "OUTBOX_BATCH_SIZE", default_value_t = 50, global = true)]
    pub outbox_batch_size: usize,

    /// Dead-letter an event after this many failed publishes. Unset retries forever.
    #[arg(long, env = "OUTBOX_MAX_ATTEMPTS", global = true)]
    pub outbox_max_attempts: Option<u32>,

    /// Due reminders triggered per tick.
    #[arg(
        long = "due-batch-size",
        env = "DUE_SCAN_BATCH_SIZE",
        default_value_t = 100,
        global = true
    )]
    pub due_scan_batch_size: usize,

    /// How long workers get to finish after a shutdown signal.
    #[arg(
        long,
        env = "SHUTDOWN_GRACE",
        default_value = "10s",
        value_parser = parse_duration,
        global = true
    )]
    pub shutdown_grace: Duration,

    /// Postgres connection string. Without it the store lives in memory.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    #[arg(
        long = "broker",
        env = "BROKER_BACKEND",
        value_enum,
        default_value_t = BrokerBackend::Memory,
        global = true
    )]
    pub broker_backend: BrokerBackend,

    /// Approximate cap on entries per Redis stream. Unset keeps streams unbounded.
    #[arg(long, env = "STREAM_MAX_LEN", global = true)]
    pub stream_max_len: Option<usize>,

    /// `local` logs text at debug level, anything else logs JSON at info.
    #[arg(long, env = "APP_ENV", default_value = "local", global = true)]
    pub app_env: String,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the due scanner and the outbox relay.
    Relay,
    /// Run the notification consumer.
    Notify,
    /// Run everything in one process.
    All,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    /// In-process broker; only useful with `all`.
    Memory,
    /// Redis Streams at the first broker address.
    RedisStreams,
}

/// Resolved runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub command: Command,
    pub brokers: Vec<String>,
    pub topics: Topics,
    pub group_id: String,
    pub consumer_name: String,
    pub interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_max_attempts: Option<u32>,
    pub due_scan_batch_size: usize,
    pub shutdown_grace: Duration,
    pub database_url: Option<String>,
    pub broker_backend: BrokerBackend,
    pub stream_max_len: Option<usize>,
    pub app_env: String,
}

impl From<Cli> for RelayConfig {
    fn from(cli: Cli) -> Self {
        let brokers = cli
            .brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .collect();

        let consumer_name = cli
            .consumer_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| {
                default_consumer_name(&cli.group_id, std::env::var("HOSTNAME").ok().as_deref())
            });

        Self {
            command: cli.command.unwrap_or(Command::All),
            brokers,
            topics: Topics::new(cli.lifecycle_topic, cli.notifications_topic),
            group_id: cli.group_id,
            consumer_name,
            interval: cli.interval,
            outbox_batch_size: cli.outbox_batch_size,
            outbox_max_attempts: cli.outbox_max_attempts,
            due_scan_batch_size: cli.due_scan_batch_size,
            shutdown_grace: cli.shutdown_grace,
            database_url: cli.database_url.filter(|url| !url.is_empty()),
            broker_backend: cli.broker_backend,
            stream_max_len: cli.stream_max_len,
            app_env: cli.app_env,
        }
    }
}

impl RelayConfig {
    /// Redis URL derived from the first broker address.
    pub fn redis_url(&self) -> String {
        match self.brokers.first() {
            Some(addr) if addr.contains("://") => addr.clone(),
            Some(addr) => format!("redis://{addr}"),
            None => "redis://localhost:6379".to_string(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.app_env == "local"
    }
}

/// Consumer name used when none is configured: stable for a given host.
fn default_consumer_name(group_id: &str, hostname: Option<&str>) -> String {
    match hostname.map(str::trim).filter(|host| !host.is_empty()) {
        Some(host) => format!("{group_id}-{host}"),
        None => format!("{group_id}-0"),
    }
}

/// Parse a duration such as `300ms`, `5s`, `1.5h` or `1m30s`.
///
/// Units: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason| ConfigError::InvalidDuration {
        input: input.to_string(),
        reason,
    };

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid("empty"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid("expected a number"));
        }
        let (number, tail) = rest.split_at(number_len);

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid("expected a number"));
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid("number out of range"))?
        };
        let mut nanos = whole
            .checked_mul(scale)
            .ok_or_else(|| invalid("number out of range"))?;
        if !fraction.is_empty() {
            let digits: u32 = fraction
                .len()
                .try_into()
                .map_err(|_| invalid("too many digits"))?;
            let denominator = 10u128
                .checked_pow(digits)
                .ok_or_else(|| invalid("too many digits"))?;
            let numerator: u128 = fraction.parse().map_err(|_| invalid("expected a number"))?;
            let part = numerator
                .checked_mul(scale)
                .ok_or_else(|| invalid("too many digits"))?
                / denominator;
            nanos = nanos
                .checked_add(part)
                .ok_or_else(|| invalid("number out of range"))?;
        }

        total = total
            .checked_add(nanos)
            .ok_or_else(|| invalid("number out of range"))?;
        rest = tail;
    }

    let secs =
        u64::try_from(total / 1_000_000_000).map_err(|_| invalid("number out of range"))?;
    Ok(Duration::new(secs, (total % 1_000_000_000) as u32))
}
