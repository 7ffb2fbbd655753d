use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery status of a reminder.
///
/// Only the due-scan worker moves a reminder from `Pending` to `Sent`.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Sent,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::Pending => "pending",
            ReminderStatus::Sent => "sent",
        }
    }
}

impl fmt::Display for ReminderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReminderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReminderStatus::Pending),
            "sent" => Ok(ReminderStatus::Sent),
            other => Err(format!("unknown reminder status: {other}")),
        }
    }
}

/// A user's reminder row.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Reminder {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub description: String,
    pub due_at: DateTime<Utc>,
    pub status: ReminderStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Reminder {
    pub fn is_pending(&self) -> bool {
        self.status == ReminderStatus::Pending
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.due_at <= now
    }

    /// Apply a partial update. Status is left untouched.
    pub fn apply(&mut self, update: ReminderUpdate, now: DateTime<Utc>) {
        if let Some(title) = update.title {
            self.title = title;
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(due_at) = update.due_at {
            self.due_at = due_at;
        }
        self.updated_at = now;
    }
}

/// Input for creating a reminder.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct NewReminder {
    pub user_id: i64,
    pub title: String,
    pub description: String,
    pub due_at: DateTime<Utc>,
}

impl NewReminder {
    pub fn new(
        user_id: i64,
        title: impl Into<String>,
        description: impl Into<String>,
        due_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            title: title.into(),
            description: description.into(),
            due_at,
        }
    }
}

/// Partial update for an existing reminder; `None` fields are kept.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct ReminderUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
}

impl ReminderUpdate {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }
}
