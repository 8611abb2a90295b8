use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// Lifecycle state of a monitoring task.
///
/// `active` tasks have a runnable scheduler job, `paused` tasks keep their
/// job suspended, and `completed` tasks have no job at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TaskState {
    Active,
    Paused,
    Completed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Active => "active",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
        }
    }
}

/// Whether a task keeps firing after its condition is first met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum NotifyBehavior {
    /// First successful notification completes the task.
    Once,
    /// Notify on every condition-met firing.
    Always,
}

/// HTTP method used for webhook deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookMethod {
    #[default]
    Post,
    Put,
}

impl WebhookMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookMethod::Post => "POST",
            WebhookMethod::Put => "PUT",
        }
    }
}

/// A configured notification destination, embedded in the task row as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NotificationChannel {
    Email {
        address: String,
    },
    Webhook {
        url: String,
        #[serde(default)]
        method: WebhookMethod,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl NotificationChannel {
    /// The stable recipient identifier used to key delivery chains.
    pub fn recipient(&self) -> &str {
        match self {
            NotificationChannel::Email { address } => address,
            NotificationChannel::Webhook { url, .. } => url,
        }
    }
}

/// A durable monitoring declaration: what to search, what condition to watch
/// for, and when to run.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    /// Primary key (UUID)
    pub id: String,

    /// Owning user id
    pub user_id: String,

    pub name: String,

    /// 5-field cron expression, interpreted in UTC.
    pub schedule: String,

    /// Natural-language search query handed to the agent.
    pub search_query: String,

    /// Natural-language condition the agent evaluates.
    pub condition_description: String,

    pub notify_behavior: NotifyBehavior,

    pub state: TaskState,

    /// Opaque JSON blob of the agent's last evidence, passed back on the
    /// next invocation for cross-run context.
    pub last_known_state: Option<String>,

    /// Back-pointer to the most recent execution.
    pub last_execution_id: Option<String>,

    /// Ordered channel descriptors, stored as JSON.
    pub notification_channels: Json<Vec<NotificationChannel>>,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub state_changed_at: NaiveDateTime,
}

/// Fields required to create a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTask {
    pub user_id: String,
    pub name: String,
    pub schedule: String,
    pub search_query: String,
    pub condition_description: String,
    pub notify_behavior: NotifyBehavior,
    pub notification_channels: Vec<NotificationChannel>,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub schedule: Option<String>,
    pub search_query: Option<String>,
    pub condition_description: Option<String>,
    pub notify_behavior: Option<NotifyBehavior>,
    pub notification_channels: Option<Vec<NotificationChannel>>,
}
