use chrono::{NaiveDateTime, Utc};
use sqlx::types::Json;
use sqlx::{Executor, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::db::models::{ExecutionFilter, ExecutionStatus, GroundingSource, TaskExecution};
use crate::error::{AppError, AppResult};

const EXECUTION_COLUMNS: &str = r#"
    id, task_id, status, started_at, completed_at, result,
    error_message, notification, grounding_sources
"#;

pub struct ExecutionRepository;

impl ExecutionRepository {
    /// Open a new execution in `running` state. Runs on any executor so the
    /// caller can pair it with the `tasks.last_execution_id` write in one
    /// transaction.
    pub async fn open<'e, E>(executor: E, task_id: &str) -> AppResult<TaskExecution>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        sqlx::query_as::<_, TaskExecution>(&format!(
            r#"
            INSERT INTO task_executions (
                id, task_id, status, started_at, completed_at, result,
                error_message, notification, grounding_sources
            ) VALUES (?, ?, ?, ?, NULL, NULL, NULL, NULL, '[]')
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(task_id)
        .bind(ExecutionStatus::Running)
        .bind(now)
        .fetch_one(executor)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<TaskExecution>> {
        sqlx::query_as::<_, TaskExecution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn latest_for_task(
        pool: &SqlitePool,
        task_id: &str,
    ) -> AppResult<Option<TaskExecution>> {
        sqlx::query_as::<_, TaskExecution>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM task_executions
            WHERE task_id = ?
            ORDER BY started_at DESC
            LIMIT 1
            "#
        ))
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn list_for_task(
        pool: &SqlitePool,
        task_id: &str,
        filter: &ExecutionFilter,
    ) -> AppResult<Vec<TaskExecution>> {
        let limit = filter.limit.unwrap_or(100);
        let offset = filter.offset.unwrap_or(0);

        sqlx::query_as::<_, TaskExecution>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM task_executions
            WHERE task_id = ?
              AND (? IS NULL OR status = ?)
            ORDER BY started_at DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(task_id)
        .bind(filter.status)
        .bind(filter.status)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Record a successful firing. Guarded so a terminal row is never
    /// rewritten. Takes any executor to join the result-mapping transaction.
    pub async fn complete_success<'e, E>(
        executor: E,
        id: &str,
        result_json: &str,
        notification: Option<&str>,
        sources: &[GroundingSource],
        completed_at: NaiveDateTime,
    ) -> AppResult<u64>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = ?, completed_at = ?, result = ?, notification = ?,
                grounding_sources = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(ExecutionStatus::Success)
        .bind(completed_at)
        .bind(result_json)
        .bind(notification)
        .bind(Json(sources.to_vec()))
        .bind(id)
        .execute(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Record a failed firing with its error classification.
    pub async fn complete_failure(
        pool: &SqlitePool,
        id: &str,
        error_message: &str,
        completed_at: NaiveDateTime,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = ?, completed_at = ?, error_message = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(ExecutionStatus::Failed)
        .bind(completed_at)
        .bind(error_message)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Startup recovery sweep: executions stranded in pending/running since
    /// before `cutoff` become `failed` with the `crash_recovered` marker.
    pub async fn sweep_stale(pool: &SqlitePool, cutoff: NaiveDateTime) -> AppResult<u64> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = ?, completed_at = ?, error_message = 'crash_recovered'
            WHERE status IN ('pending', 'running') AND started_at < ?
            "#,
        )
        .bind(ExecutionStatus::Failed)
        .bind(now)
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}
