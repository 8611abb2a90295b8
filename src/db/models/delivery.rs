use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ChannelType {
    Email,
    Webhook,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Email => "email",
            ChannelType::Webhook => "webhook",
        }
    }
}

/// Delivery attempt outcome.
///
/// `success` is terminal. `failed` is terminal and only written once the
/// retry budget is exhausted or the failure is permanent. `retrying` means
/// another attempt is scheduled at `next_retry_at` (and is how an
/// interrupted chain survives a restart).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failed,
    Retrying,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }
}

/// One notification delivery attempt.
///
/// The retry chain for a given (execution, recipient) is the set of rows
/// sharing those keys, ordered by strictly increasing `attempt`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationDelivery {
    /// Primary key (UUID)
    pub id: String,

    pub execution_id: String,

    pub channel_type: ChannelType,

    /// Email address or webhook URL.
    pub recipient: String,

    pub status: DeliveryStatus,

    /// HTTP status observed, when the channel speaks HTTP.
    pub http_status: Option<i64>,

    /// 1-based attempt counter within the chain.
    pub attempt: i64,

    /// When the next attempt becomes due (only for `retrying`).
    pub next_retry_at: Option<NaiveDateTime>,

    pub error_message: Option<String>,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Data recorded for one resolved delivery attempt.
#[derive(Debug, Clone)]
pub struct RecordDeliveryAttempt {
    pub execution_id: String,
    pub channel_type: ChannelType,
    pub recipient: String,
    pub status: DeliveryStatus,
    pub http_status: Option<i64>,
    pub attempt: i64,
    pub next_retry_at: Option<NaiveDateTime>,
    pub error_message: Option<String>,
}
