//! Internal task operations consumed by the REST layer, CLI and admin tools.
//!
//! Everything here validates at the boundary: a rejected request mutates
//! nothing.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::{
    CreateTask, ExecutionFilter, ExecutionStatus, NotificationChannel, NotificationDelivery,
    Task, TaskExecution, TaskPatch, TaskState,
};
use crate::db::repository::{DeliveryRepository, ExecutionRepository, JobStore, TaskRepository};
use crate::error::{AppError, AppResult};
use crate::services::cron;
use crate::services::orchestrator::{ExecutionOrchestrator, FiringKind};
use crate::services::state_machine::TaskStateMachine;

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub user_id: Option<String>,
    pub state: Option<TaskState>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub struct TaskService {
    pool: SqlitePool,
    orchestrator: Arc<ExecutionOrchestrator>,
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService").finish_non_exhaustive()
    }
}

impl TaskService {
    pub fn new(pool: SqlitePool, orchestrator: Arc<ExecutionOrchestrator>) -> Self {
        Self { pool, orchestrator }
    }

    /// Create a task and seed its scheduler job at the next cron instant.
    pub async fn create_task(&self, fields: CreateTask) -> AppResult<Task> {
        if fields.name.trim().is_empty() {
            return Err(AppError::Validation("task name must not be empty".to_string()));
        }
        if fields.search_query.trim().is_empty() {
            return Err(AppError::Validation("search query must not be empty".to_string()));
        }
        let next_fire_at = cron::next_fire(&fields.schedule, Utc::now().naive_utc())?;
        validate_channels(&fields.notification_channels)?;

        let task = TaskRepository::create(&self.pool, fields).await?;
        JobStore::upsert(&self.pool, &task.id, &task.schedule, next_fire_at).await?;

        tracing::info!(
            task_id = %task.id,
            user_id = %task.user_id,
            schedule = %task.schedule,
            next_fire_at = %next_fire_at,
            "task created"
        );
        Ok(task)
    }

    /// Apply a partial update. A schedule change recomputes the job's next
    /// fire time; the paused flag survives the recompute.
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> AppResult<Task> {
        let mut task = self.get_task(id).await?;

        let new_schedule = match &patch.schedule {
            Some(schedule) if *schedule != task.schedule => {
                // Validate before any write lands.
                cron::validate(schedule)?;
                Some(schedule.clone())
            }
            _ => None,
        };
        if let Some(channels) = &patch.notification_channels {
            validate_channels(channels)?;
        }

        if let Some(name) = patch.name {
            task.name = name;
        }
        if let Some(schedule) = patch.schedule {
            task.schedule = schedule;
        }
        if let Some(search_query) = patch.search_query {
            task.search_query = search_query;
        }
        if let Some(condition_description) = patch.condition_description {
            task.condition_description = condition_description;
        }
        if let Some(notify_behavior) = patch.notify_behavior {
            task.notify_behavior = notify_behavior;
        }
        if let Some(channels) = patch.notification_channels {
            task.notification_channels = sqlx::types::Json(channels);
        }

        let updated = TaskRepository::update(&self.pool, &task).await?;

        if let Some(schedule) = new_schedule {
            if updated.state != TaskState::Completed {
                let next_fire_at = cron::next_fire(&schedule, Utc::now().naive_utc())?;
                JobStore::upsert(&self.pool, &updated.id, &schedule, next_fire_at).await?;
                tracing::info!(
                    task_id = %updated.id,
                    schedule = %schedule,
                    next_fire_at = %next_fire_at,
                    "schedule changed, job recomputed"
                );
            }
        }

        Ok(updated)
    }

    /// Delete a task and its scheduler job. Execution history is retained as
    /// an audit trail. Deletion while a firing is in flight is rejected.
    pub async fn delete_task(&self, id: &str) -> AppResult<()> {
        self.get_task(id).await?;
        self.ensure_not_firing(id).await?;

        JobStore::delete(&self.pool, id).await?;
        TaskRepository::delete(&self.pool, id).await?;

        tracing::info!(task_id = %id, "task deleted, execution history retained");
        Ok(())
    }

    pub async fn transition_task(&self, id: &str, target: TaskState) -> AppResult<Task> {
        TaskStateMachine::transition(&self.pool, id, target).await
    }

    /// Fire a task now, outside its schedule. The cron job is left alone.
    /// Returns the execution id; the firing itself continues in the
    /// background.
    pub async fn execute_now(&self, id: &str) -> AppResult<String> {
        let task = self.get_task(id).await?;
        if task.state == TaskState::Completed {
            return Err(AppError::Conflict(format!(
                "task {id} is completed; restart it before executing"
            )));
        }
        self.ensure_not_firing(id).await?;

        let execution = self.orchestrator.open_execution(&task).await?;
        let execution_id = execution.id.clone();

        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            if let Err(error) = orchestrator
                .continue_firing(task, execution, FiringKind::Manual)
                .await
            {
                tracing::warn!(%error, "ad-hoc firing failed");
            }
        });

        Ok(execution_id)
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> AppResult<Vec<Task>> {
        TaskRepository::list(
            &self.pool,
            filter.user_id.as_deref(),
            filter.state,
            filter.limit,
            filter.offset,
        )
        .await
    }

    pub async fn get_task(&self, id: &str) -> AppResult<Task> {
        TaskRepository::find_by_id(&self.pool, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {id}")))
    }

    pub async fn get_executions(
        &self,
        task_id: &str,
        filter: &ExecutionFilter,
    ) -> AppResult<Vec<TaskExecution>> {
        ExecutionRepository::list_for_task(&self.pool, task_id, filter).await
    }

    pub async fn get_deliveries(&self, execution_id: &str) -> AppResult<Vec<NotificationDelivery>> {
        DeliveryRepository::list_for_execution(&self.pool, execution_id).await
    }

    /// User deactivation: every active task the user owns gets paused.
    /// Failures on individual tasks are logged and skipped so one bad row
    /// cannot wedge the bulk operation.
    pub async fn pause_tasks_for_user(&self, user_id: &str) -> AppResult<usize> {
        let tasks =
            TaskRepository::list_by_user_and_state(&self.pool, user_id, TaskState::Active).await?;

        let mut paused = 0;
        for task in tasks {
            match TaskStateMachine::transition(&self.pool, &task.id, TaskState::Paused).await {
                Ok(_) => paused += 1,
                Err(error) => {
                    tracing::warn!(task_id = %task.id, %error, "bulk pause skipped task");
                }
            }
        }

        tracing::info!(user_id = %user_id, paused, "user deactivation paused active tasks");
        Ok(paused)
    }

    async fn ensure_not_firing(&self, task_id: &str) -> AppResult<()> {
        if let Some(latest) = ExecutionRepository::latest_for_task(&self.pool, task_id).await? {
            if matches!(
                latest.status,
                ExecutionStatus::Pending | ExecutionStatus::Running
            ) {
                return Err(AppError::TaskBusy(format!(
                    "task {task_id} has execution {} in flight",
                    latest.id
                )));
            }
        }
        Ok(())
    }
}

fn validate_channels(channels: &[NotificationChannel]) -> AppResult<()> {
    for channel in channels {
        match channel {
            NotificationChannel::Email { address } => {
                address.parse::<lettre::message::Mailbox>().map_err(|e| {
                    AppError::InvalidChannel(format!("email address '{address}': {e}"))
                })?;
            }
            NotificationChannel::Webhook { url, .. } => {
                let parsed = url::Url::parse(url)
                    .map_err(|e| AppError::InvalidChannel(format!("webhook url '{url}': {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(AppError::InvalidChannel(format!(
                        "webhook url '{url}': scheme must be http or https"
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notifications::NotificationDispatcher;
    use crate::testutil::{fast_retry_config, sample_create_task, spawn_agent_stub, test_pool};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast;

    async fn service(pool: &SqlitePool, agent_url: Option<String>) -> TaskService {
        let mut config = fast_retry_config();
        if let Some(url) = agent_url {
            config.agent.url = url;
        }
        let (shutdown, _) = broadcast::channel(1);
        let dispatcher =
            Arc::new(NotificationDispatcher::new(pool.clone(), &config, shutdown).unwrap());
        let orchestrator =
            Arc::new(ExecutionOrchestrator::new(pool.clone(), &config, dispatcher).unwrap());
        TaskService::new(pool.clone(), orchestrator)
    }

    #[tokio::test]
    async fn create_task_seeds_a_runnable_job() {
        let pool = test_pool().await;
        let service = service(&pool, None).await;

        let task = service
            .create_task(sample_create_task("user-1", vec![]))
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Active);

        let job = JobStore::find(&pool, &task.id).await.unwrap().unwrap();
        assert!(!job.paused);
        assert!(job.next_fire_at > Utc::now().naive_utc());
        assert_eq!(job.cron_expr, task.schedule);
    }

    #[tokio::test]
    async fn invalid_inputs_are_rejected_without_state_mutation() {
        let pool = test_pool().await;
        let service = service(&pool, None).await;

        let mut unnamed = sample_create_task("user-1", vec![]);
        unnamed.name = "  ".to_string();
        assert!(matches!(
            service.create_task(unnamed).await,
            Err(AppError::Validation(_))
        ));

        let mut bad_cron = sample_create_task("user-1", vec![]);
        bad_cron.schedule = "every tuesday".to_string();
        assert!(matches!(
            service.create_task(bad_cron).await,
            Err(AppError::InvalidCron(_))
        ));

        let bad_channel = sample_create_task(
            "user-1",
            vec![NotificationChannel::Webhook {
                url: "ftp://example.test".to_string(),
                method: Default::default(),
                headers: Default::default(),
            }],
        );
        assert!(matches!(
            service.create_task(bad_channel).await,
            Err(AppError::InvalidChannel(_))
        ));

        let bad_email = sample_create_task(
            "user-1",
            vec![NotificationChannel::Email {
                address: "not-an-address".to_string(),
            }],
        );
        assert!(matches!(
            service.create_task(bad_email).await,
            Err(AppError::InvalidChannel(_))
        ));

        assert!(service
            .list_tasks(&TaskFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn schedule_change_recomputes_the_job() {
        let pool = test_pool().await;
        let service = service(&pool, None).await;

        let task = service
            .create_task(sample_create_task("user-1", vec![]))
            .await
            .unwrap();
        let before = JobStore::find(&pool, &task.id).await.unwrap().unwrap();

        let updated = service
            .update_task(
                &task.id,
                TaskPatch {
                    schedule: Some("30 6 * * *".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.schedule, "30 6 * * *");

        let job = JobStore::find(&pool, &task.id).await.unwrap().unwrap();
        assert_eq!(job.cron_expr, "30 6 * * *");
        assert_ne!(job.next_fire_at, before.next_fire_at);
    }

    #[tokio::test]
    async fn schedule_change_keeps_a_paused_job_paused() {
        let pool = test_pool().await;
        let service = service(&pool, None).await;

        let task = service
            .create_task(sample_create_task("user-1", vec![]))
            .await
            .unwrap();
        service.transition_task(&task.id, TaskState::Paused).await.unwrap();

        service
            .update_task(
                &task.id,
                TaskPatch {
                    schedule: Some("15 3 * * *".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = JobStore::find(&pool, &task.id).await.unwrap().unwrap();
        assert!(job.paused, "recompute must not resume a paused job");
    }

    #[tokio::test]
    async fn delete_is_rejected_while_firing_then_retains_history() {
        let pool = test_pool().await;
        let service = service(&pool, None).await;

        let task = service
            .create_task(sample_create_task("user-1", vec![]))
            .await
            .unwrap();
        let execution = ExecutionRepository::open(&pool, &task.id).await.unwrap();

        assert!(matches!(
            service.delete_task(&task.id).await,
            Err(AppError::TaskBusy(_))
        ));

        ExecutionRepository::complete_failure(
            &pool,
            &execution.id,
            "agent_timeout: test",
            Utc::now().naive_utc(),
        )
        .await
        .unwrap();

        service.delete_task(&task.id).await.unwrap();
        assert!(TaskRepository::find_by_id(&pool, &task.id).await.unwrap().is_none());
        assert!(JobStore::find(&pool, &task.id).await.unwrap().is_none());

        let history = ExecutionRepository::list_for_task(
            &pool,
            &task.id,
            &ExecutionFilter::default(),
        )
        .await
        .unwrap();
        assert_eq!(history.len(), 1, "execution history survives task deletion");
    }

    #[tokio::test]
    async fn execute_now_fires_without_touching_the_schedule() {
        let pool = test_pool().await;
        let agent = spawn_agent_stub(json!({
            "evidence": "manual check",
            "sources": [],
            "confidence": 40,
            "next_run": "2099-01-01T00:00:00Z",
            "notification": null
        }))
        .await;
        let service = service(&pool, Some(agent)).await;

        let task = service
            .create_task(sample_create_task("user-1", vec![]))
            .await
            .unwrap();
        let job_before = JobStore::find(&pool, &task.id).await.unwrap().unwrap();

        let execution_id = service.execute_now(&task.id).await.unwrap();

        for _ in 0..100 {
            let execution = ExecutionRepository::find_by_id(&pool, &execution_id)
                .await
                .unwrap()
                .unwrap();
            if execution.status == ExecutionStatus::Success {
                let job = JobStore::find(&pool, &task.id).await.unwrap().unwrap();
                assert_eq!(
                    job.next_fire_at, job_before.next_fire_at,
                    "ad-hoc firing must not move the cron schedule, even when the agent recommends one"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("ad-hoc execution never completed");
    }

    #[tokio::test]
    async fn execute_now_rejects_concurrent_firings() {
        let pool = test_pool().await;
        let service = service(&pool, None).await;

        let task = service
            .create_task(sample_create_task("user-1", vec![]))
            .await
            .unwrap();
        ExecutionRepository::open(&pool, &task.id).await.unwrap();

        assert!(matches!(
            service.execute_now(&task.id).await,
            Err(AppError::TaskBusy(_))
        ));
    }

    #[tokio::test]
    async fn user_deactivation_pauses_only_that_users_active_tasks() {
        let pool = test_pool().await;
        let service = service(&pool, None).await;

        let a = service.create_task(sample_create_task("user-1", vec![])).await.unwrap();
        let b = service.create_task(sample_create_task("user-1", vec![])).await.unwrap();
        let other = service.create_task(sample_create_task("user-2", vec![])).await.unwrap();
        service.transition_task(&b.id, TaskState::Paused).await.unwrap();
        service.transition_task(&b.id, TaskState::Active).await.unwrap();

        let paused = service.pause_tasks_for_user("user-1").await.unwrap();
        assert_eq!(paused, 2);

        for id in [&a.id, &b.id] {
            let task = service.get_task(id).await.unwrap();
            assert_eq!(task.state, TaskState::Paused);
            assert!(JobStore::find(&pool, id).await.unwrap().unwrap().paused);
        }
        assert_eq!(service.get_task(&other.id).await.unwrap().state, TaskState::Active);
    }
}
