use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    /// Terminal executions are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failed)
    }
}

/// A URI the agent cited as evidence for its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub uri: String,
    pub title: Option<String>,
}

/// One firing of a task.
///
/// Rows are opened in `running` state by the orchestrator and become
/// immutable once they reach `success` or `failed`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskExecution {
    /// Primary key (UUID)
    pub id: String,

    pub task_id: String,

    pub status: ExecutionStatus,

    pub started_at: NaiveDateTime,

    /// Set when the execution reaches a terminal status.
    pub completed_at: Option<NaiveDateTime>,

    /// The agent's response envelope, stored verbatim as JSON for audit.
    pub result: Option<String>,

    pub error_message: Option<String>,

    /// User-facing message when the condition was met.
    pub notification: Option<String>,

    /// Ordered grounding sources cited by the agent.
    pub grounding_sources: Json<Vec<GroundingSource>>,
}

/// Filter for execution history queries.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
