use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The scheduler's own record of a task's next firing.
///
/// One row exists per non-completed task (`job_id` equals the task id).
/// `version` is a monotonic counter used for optimistic concurrency: a
/// `claim` only succeeds if the version it read is still current, which is
/// what keeps two scheduler processes from firing the same instant twice.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub cron_expr: String,
    pub next_fire_at: NaiveDateTime,
    pub paused: bool,
    pub version: i64,
}
