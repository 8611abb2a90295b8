use crate::services::agent::AgentError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Task is busy: {0}")]
    TaskBusy(String),

    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Schedule has no future fire time: {0}")]
    NoFutureFire(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Invalid notification channel: {0}")]
    InvalidChannel(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Illegal state transition: {0}")]
    IllegalTransition(String),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;
