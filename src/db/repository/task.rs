use chrono::{NaiveDateTime, Utc};
use sqlx::types::Json;
use sqlx::{Executor, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::db::models::{CreateTask, Task, TaskState};
use crate::error::{AppError, AppResult};

const TASK_COLUMNS: &str = r#"
    id, user_id, name, schedule, search_query, condition_description,
    notify_behavior, state, last_known_state, last_execution_id,
    notification_channels, created_at, updated_at, state_changed_at
"#;

pub struct TaskRepository;

impl TaskRepository {
    pub async fn create(pool: &SqlitePool, task: CreateTask) -> AppResult<Task> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, Task>(&format!(
            r#"
            INSERT INTO tasks (
                id, user_id, name, schedule, search_query, condition_description,
                notify_behavior, state, last_known_state, last_execution_id,
                notification_channels, created_at, updated_at, state_changed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(task.user_id)
        .bind(task.name)
        .bind(task.schedule)
        .bind(task.search_query)
        .bind(task.condition_description)
        .bind(task.notify_behavior)
        .bind(TaskState::Active)
        .bind::<Option<String>>(None)
        .bind::<Option<String>>(None)
        .bind(Json(task.notification_channels))
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Task>> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn list(
        pool: &SqlitePool,
        user_id: Option<&str>,
        state: Option<TaskState>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> AppResult<Vec<Task>> {
        let limit_val = limit.unwrap_or(100);
        let offset_val = offset.unwrap_or(0);

        sqlx::query_as::<_, Task>(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE (? IS NULL OR user_id = ?)
              AND (? IS NULL OR state = ?)
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(user_id)
        .bind(user_id)
        .bind(state)
        .bind(state)
        .bind(limit_val)
        .bind(offset_val)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn list_by_user_and_state(
        pool: &SqlitePool,
        user_id: &str,
        state: TaskState,
    ) -> AppResult<Vec<Task>> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ? AND state = ? ORDER BY created_at"
        ))
        .bind(user_id)
        .bind(state)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Persist the mutable descriptor fields of `task` and return the fresh row.
    pub async fn update(pool: &SqlitePool, task: &Task) -> AppResult<Task> {
        let now = Utc::now().naive_utc();

        sqlx::query_as::<_, Task>(&format!(
            r#"
            UPDATE tasks
            SET name = ?, schedule = ?, search_query = ?, condition_description = ?,
                notify_behavior = ?, notification_channels = ?, updated_at = ?
            WHERE id = ?
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(&task.name)
        .bind(&task.schedule)
        .bind(&task.search_query)
        .bind(&task.condition_description)
        .bind(task.notify_behavior)
        .bind(&task.notification_channels)
        .bind(now)
        .bind(&task.id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Optimistic state write: only succeeds while the row is still in `from`.
    /// Returns the number of rows updated (0 means the check failed).
    pub async fn update_state(
        pool: &SqlitePool,
        id: &str,
        from: TaskState,
        to: TaskState,
        state_changed_at: NaiveDateTime,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = ?, state_changed_at = ?, updated_at = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(to)
        .bind(state_changed_at)
        .bind(state_changed_at)
        .bind(id)
        .bind(from)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Point the task at its most recent execution. Takes any executor so it
    /// can run inside the execution-open transaction.
    pub async fn set_last_execution<'e, E>(
        executor: E,
        task_id: &str,
        execution_id: &str,
    ) -> AppResult<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let now = Utc::now().naive_utc();
        sqlx::query("UPDATE tasks SET last_execution_id = ?, updated_at = ? WHERE id = ?")
            .bind(execution_id)
            .bind(now)
            .bind(task_id)
            .execute(executor)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    /// Store the agent's latest evidence blob for cross-run context.
    pub async fn set_last_known_state<'e, E>(
        executor: E,
        task_id: &str,
        evidence: &str,
    ) -> AppResult<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let now = Utc::now().naive_utc();
        sqlx::query("UPDATE tasks SET last_known_state = ?, updated_at = ? WHERE id = ?")
            .bind(evidence)
            .bind(now)
            .bind(task_id)
            .execute(executor)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }
}
