//! Task state machine: legal transitions plus the scheduler side effects
//! that keep the job store consistent with the task table.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::{Task, TaskState};
use crate::db::repository::{JobStore, TaskRepository};
use crate::error::{AppError, AppResult};
use crate::services::cron;

/// Whether `from → to` is a legal transition. Same-state is handled by the
/// caller as a no-op before this check.
fn allowed(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (Active, Paused)
            | (Paused, Active)
            | (Active, Completed)
            | (Paused, Completed)
            | (Completed, Active)
    )
}

pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Transition a task to `target`.
    ///
    /// Algorithm: optimistic check against the persisted state, write the new
    /// state, then apply the scheduler side effect. If the side effect fails
    /// the state write is rolled back and the error surfaced; a failure
    /// during rollback is logged for manual reconciliation, never swallowed
    /// silently.
    pub async fn transition(
        pool: &SqlitePool,
        task_id: &str,
        target: TaskState,
    ) -> AppResult<Task> {
        let task = TaskRepository::find_by_id(pool, task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;

        let current = task.state;

        // No-op transition: return without any write.
        if current == target {
            return Ok(task);
        }

        if !allowed(current, target) {
            return Err(AppError::IllegalTransition(format!(
                "{} -> {} is not allowed",
                current.as_str(),
                target.as_str()
            )));
        }

        let now = Utc::now().naive_utc();
        let updated = TaskRepository::update_state(pool, task_id, current, target, now).await?;
        if updated == 0 {
            // Someone else transitioned the task between our read and write.
            return Err(AppError::Conflict(format!(
                "task {task_id} is no longer in state {}",
                current.as_str()
            )));
        }

        if let Err(side_effect_error) = Self::apply_side_effect(pool, &task, target).await {
            tracing::warn!(
                task_id = %task_id,
                target = target.as_str(),
                error = %side_effect_error,
                "scheduler side effect failed, rolling back state write"
            );

            match TaskRepository::update_state(pool, task_id, target, current, now).await {
                Ok(1) => {}
                Ok(_) => {
                    tracing::error!(
                        task_id = %task_id,
                        "rollback found unexpected task state; manual reconciliation required"
                    );
                }
                Err(rollback_error) => {
                    tracing::error!(
                        task_id = %task_id,
                        %rollback_error,
                        "rollback of state write failed; manual reconciliation required"
                    );
                }
            }

            return Err(side_effect_error);
        }

        tracing::info!(
            task_id = %task_id,
            from = current.as_str(),
            to = target.as_str(),
            "task state changed"
        );

        TaskRepository::find_by_id(pool, task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))
    }

    async fn apply_side_effect(pool: &SqlitePool, task: &Task, target: TaskState) -> AppResult<()> {
        match target {
            TaskState::Paused => {
                let paused = JobStore::pause(pool, &task.id).await?;
                if paused == 0 {
                    return Err(AppError::NotFound(format!(
                        "scheduler job for task {}",
                        task.id
                    )));
                }
                Ok(())
            }
            TaskState::Active => {
                if JobStore::find(pool, &task.id).await?.is_some() {
                    JobStore::resume(pool, &task.id).await?;
                } else {
                    // Restarting a completed task: its job was deleted, so a
                    // fresh one is seeded from the cron schedule.
                    let next = cron::next_fire(&task.schedule, Utc::now().naive_utc())?;
                    JobStore::upsert(pool, &task.id, &task.schedule, next).await?;
                }
                Ok(())
            }
            TaskState::Completed => {
                JobStore::delete(pool, &task.id).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{sample_create_task, test_pool};

    async fn active_task(pool: &SqlitePool) -> Task {
        let task = TaskRepository::create(pool, sample_create_task("user-1", vec![]))
            .await
            .unwrap();
        let next = cron::next_fire(&task.schedule, Utc::now().naive_utc()).unwrap();
        JobStore::upsert(pool, &task.id, &task.schedule, next).await.unwrap();
        task
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_the_job_flag() {
        let pool = test_pool().await;
        let task = active_task(&pool).await;

        let paused = TaskStateMachine::transition(&pool, &task.id, TaskState::Paused)
            .await
            .unwrap();
        assert_eq!(paused.state, TaskState::Paused);
        assert!(JobStore::find(&pool, &task.id).await.unwrap().unwrap().paused);

        let resumed = TaskStateMachine::transition(&pool, &task.id, TaskState::Active)
            .await
            .unwrap();
        assert_eq!(resumed.state, TaskState::Active);
        assert!(!JobStore::find(&pool, &task.id).await.unwrap().unwrap().paused);
    }

    #[tokio::test]
    async fn completing_a_task_removes_its_job() {
        let pool = test_pool().await;
        let task = active_task(&pool).await;

        let completed = TaskStateMachine::transition(&pool, &task.id, TaskState::Completed)
            .await
            .unwrap();
        assert_eq!(completed.state, TaskState::Completed);
        assert!(JobStore::find(&pool, &task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restarting_a_completed_task_seeds_a_fresh_job() {
        let pool = test_pool().await;
        let task = active_task(&pool).await;

        TaskStateMachine::transition(&pool, &task.id, TaskState::Completed)
            .await
            .unwrap();
        let restarted = TaskStateMachine::transition(&pool, &task.id, TaskState::Active)
            .await
            .unwrap();
        assert_eq!(restarted.state, TaskState::Active);

        let job = JobStore::find(&pool, &task.id).await.unwrap().unwrap();
        assert!(!job.paused);
        assert!(job.next_fire_at > Utc::now().naive_utc());
    }

    #[tokio::test]
    async fn completed_to_paused_is_rejected() {
        let pool = test_pool().await;
        let task = active_task(&pool).await;

        TaskStateMachine::transition(&pool, &task.id, TaskState::Completed)
            .await
            .unwrap();
        let err = TaskStateMachine::transition(&pool, &task.id, TaskState::Paused)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::IllegalTransition(_)));
    }

    #[tokio::test]
    async fn same_state_transition_is_a_no_op_without_write() {
        let pool = test_pool().await;
        let task = active_task(&pool).await;

        let unchanged = TaskStateMachine::transition(&pool, &task.id, TaskState::Active)
            .await
            .unwrap();
        assert_eq!(unchanged.state_changed_at, task.state_changed_at);
        assert_eq!(unchanged.updated_at, task.updated_at);
    }

    #[tokio::test]
    async fn pausing_without_a_job_rolls_the_state_back() {
        let pool = test_pool().await;
        // Task created without a scheduler job: the pause side effect fails.
        let task = TaskRepository::create(&pool, sample_create_task("user-1", vec![]))
            .await
            .unwrap();

        let err = TaskStateMachine::transition(&pool, &task.id, TaskState::Paused)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let reloaded = TaskRepository::find_by_id(&pool, &task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, TaskState::Active, "state write was rolled back");
    }
}
