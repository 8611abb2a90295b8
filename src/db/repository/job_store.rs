use chrono::NaiveDateTime;
use sqlx::SqlitePool;

use crate::db::models::ScheduledJob;
use crate::error::{AppError, AppResult};

const JOB_COLUMNS: &str = "job_id, cron_expr, next_fire_at, paused, version";

/// Durable table of scheduler jobs.
///
/// The scheduler loop and the task state machine are the only callers; no
/// other subsystem mutates these rows. All mutations bump `version` so a
/// concurrent `claim` holding a stale version loses cleanly.
pub struct JobStore;

impl JobStore {
    /// Create or replace the job for a task. On replace, the paused flag is
    /// preserved so a reschedule racing a pause cannot un-pause the job.
    pub async fn upsert(
        pool: &SqlitePool,
        job_id: &str,
        cron_expr: &str,
        next_fire_at: NaiveDateTime,
    ) -> AppResult<ScheduledJob> {
        sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            INSERT INTO scheduled_jobs (job_id, cron_expr, next_fire_at, paused, version)
            VALUES (?, ?, ?, 0, 1)
            ON CONFLICT(job_id) DO UPDATE SET
                cron_expr = excluded.cron_expr,
                next_fire_at = excluded.next_fire_at,
                version = scheduled_jobs.version + 1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(cron_expr)
        .bind(next_fire_at)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find(pool: &SqlitePool, job_id: &str) -> AppResult<Option<ScheduledJob>> {
        sqlx::query_as::<_, ScheduledJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE job_id = ?"
        ))
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn delete(pool: &SqlitePool, job_id: &str) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }

    pub async fn pause(pool: &SqlitePool, job_id: &str) -> AppResult<u64> {
        let result =
            sqlx::query("UPDATE scheduled_jobs SET paused = 1, version = version + 1 WHERE job_id = ?")
                .bind(job_id)
                .execute(pool)
                .await
                .map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }

    pub async fn resume(pool: &SqlitePool, job_id: &str) -> AppResult<u64> {
        let result =
            sqlx::query("UPDATE scheduled_jobs SET paused = 0, version = version + 1 WHERE job_id = ?")
                .bind(job_id)
                .execute(pool)
                .await
                .map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }

    /// Unpaused jobs due at or before `before`, soonest first.
    pub async fn due(
        pool: &SqlitePool,
        before: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<ScheduledJob>> {
        sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM scheduled_jobs
            WHERE paused = 0 AND next_fire_at <= ?
            ORDER BY next_fire_at ASC
            LIMIT ?
            "#
        ))
        .bind(before)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Claim one firing: advance `next_fire_at` past the claimed instant,
    /// keyed on the version the caller read. Returns false when another
    /// process already claimed this fire (or the job was paused/removed in
    /// the meantime) — the caller must then abort the firing as a no-op.
    pub async fn claim(
        pool: &SqlitePool,
        job: &ScheduledJob,
        next_fire_at: NaiveDateTime,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET next_fire_at = ?, version = version + 1
            WHERE job_id = ? AND version = ? AND paused = 0
            "#,
        )
        .bind(next_fire_at)
        .bind(&job.job_id)
        .bind(job.version)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    /// Post-firing reschedule. Only touches unpaused rows: a pause that
    /// landed while the firing ran wins, and a job deleted by task
    /// completion stays deleted. Returns whether a row was advanced.
    pub async fn reschedule(
        pool: &SqlitePool,
        job_id: &str,
        next_fire_at: NaiveDateTime,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET next_fire_at = ?, version = version + 1
            WHERE job_id = ? AND paused = 0
            "#,
        )
        .bind(next_fire_at)
        .bind(job_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_pool;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn upsert_creates_then_replaces_preserving_paused() {
        let pool = test_pool().await;
        let now = Utc::now().naive_utc();

        let job = JobStore::upsert(&pool, "job-1", "0 9 * * *", now).await.unwrap();
        assert_eq!(job.version, 1);
        assert!(!job.paused);

        JobStore::pause(&pool, "job-1").await.unwrap();

        let replaced = JobStore::upsert(&pool, "job-1", "30 9 * * *", now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(replaced.cron_expr, "30 9 * * *");
        assert!(replaced.paused, "upsert must not clear the paused flag");
        assert!(replaced.version > job.version);
    }

    #[tokio::test]
    async fn due_returns_only_unpaused_jobs_in_order() {
        let pool = test_pool().await;
        let now = Utc::now().naive_utc();

        JobStore::upsert(&pool, "late", "0 9 * * *", now - Duration::minutes(1))
            .await
            .unwrap();
        JobStore::upsert(&pool, "later", "0 9 * * *", now - Duration::minutes(5))
            .await
            .unwrap();
        JobStore::upsert(&pool, "future", "0 9 * * *", now + Duration::hours(1))
            .await
            .unwrap();
        JobStore::upsert(&pool, "paused", "0 9 * * *", now - Duration::minutes(10))
            .await
            .unwrap();
        JobStore::pause(&pool, "paused").await.unwrap();

        let due = JobStore::due(&pool, now, 10).await.unwrap();
        let ids: Vec<_> = due.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["later", "late"]);
    }

    #[tokio::test]
    async fn claim_wins_once_per_version() {
        let pool = test_pool().await;
        let now = Utc::now().naive_utc();
        let next = now + Duration::hours(24);

        let job = JobStore::upsert(&pool, "job-1", "0 9 * * *", now).await.unwrap();

        assert!(JobStore::claim(&pool, &job, next).await.unwrap());
        // Same snapshot again: the version moved on, so the second claim loses.
        assert!(!JobStore::claim(&pool, &job, next).await.unwrap());

        let current = JobStore::find(&pool, "job-1").await.unwrap().unwrap();
        assert_eq!(current.next_fire_at, next, "next_fire_at advanced exactly once");
    }

    #[tokio::test]
    async fn claim_refuses_paused_job() {
        let pool = test_pool().await;
        let now = Utc::now().naive_utc();

        let job = JobStore::upsert(&pool, "job-1", "0 9 * * *", now).await.unwrap();
        JobStore::pause(&pool, "job-1").await.unwrap();

        assert!(!JobStore::claim(&pool, &job, now + Duration::hours(1)).await.unwrap());
    }

    #[tokio::test]
    async fn reschedule_skips_paused_and_missing_jobs() {
        let pool = test_pool().await;
        let now = Utc::now().naive_utc();

        JobStore::upsert(&pool, "job-1", "0 9 * * *", now).await.unwrap();
        JobStore::pause(&pool, "job-1").await.unwrap();

        assert!(!JobStore::reschedule(&pool, "job-1", now + Duration::hours(1)).await.unwrap());
        assert!(!JobStore::reschedule(&pool, "missing", now).await.unwrap());

        JobStore::resume(&pool, "job-1").await.unwrap();
        assert!(JobStore::reschedule(&pool, "job-1", now + Duration::hours(2)).await.unwrap());
    }
}
