//! Execution orchestrator: one task firing from claim to reschedule.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::models::{GroundingSource, NotifyBehavior, Task, TaskExecution, TaskState};
use crate::db::repository::{ExecutionRepository, JobStore, TaskRepository};
use crate::error::{AppError, AppResult};
use crate::services::agent::{AgentClient, AgentEnvelope, AgentError, AgentRequest};
use crate::services::cron;
use crate::services::notifications::NotificationDispatcher;
use crate::services::state_machine::TaskStateMachine;
use crate::services::webhook::WebhookPayload;

/// How a firing was initiated. Manual firings (`execute_now`) leave the
/// scheduled job untouched; scheduled firings reschedule when they finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiringKind {
    Scheduled,
    Manual,
}

pub struct ExecutionOrchestrator {
    pool: SqlitePool,
    agent: AgentClient,
    dispatcher: Arc<NotificationDispatcher>,
    agent_timeout: Duration,
}

impl std::fmt::Debug for ExecutionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionOrchestrator").finish_non_exhaustive()
    }
}

impl ExecutionOrchestrator {
    pub fn new(
        pool: SqlitePool,
        config: &Config,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> AppResult<Self> {
        Ok(Self {
            pool,
            agent: AgentClient::new(&config.agent)?,
            dispatcher,
            agent_timeout: Duration::from_secs(config.agent.timeout_seconds),
        })
    }

    /// Execute one scheduled firing end-to-end. Returns the execution id, or
    /// `None` when the firing aborts as a no-op because the task vanished or
    /// completed between claim and execution.
    #[tracing::instrument(skip(self), fields(task_id = %task_id))]
    pub async fn fire_scheduled(&self, task_id: &str) -> AppResult<Option<String>> {
        let Some(task) = TaskRepository::find_by_id(&self.pool, task_id).await? else {
            tracing::debug!("task gone before firing, aborting");
            return Ok(None);
        };
        if task.state == TaskState::Completed {
            tracing::debug!("task completed before firing, aborting");
            return Ok(None);
        }

        let execution = self.open_execution(&task).await?;
        let execution_id = execution.id.clone();
        self.continue_firing(task, execution, FiringKind::Scheduled).await?;
        Ok(Some(execution_id))
    }

    /// Step 1: open the execution record, atomically with the task's
    /// back-pointer to it.
    pub async fn open_execution(&self, task: &Task) -> AppResult<TaskExecution> {
        let mut tx = self.pool.begin().await.map_err(AppError::Database)?;
        let execution = ExecutionRepository::open(&mut *tx, &task.id).await?;
        TaskRepository::set_last_execution(&mut *tx, &task.id, &execution.id).await?;
        tx.commit().await.map_err(AppError::Database)?;

        tracing::info!(
            task_id = %task.id,
            execution_id = %execution.id,
            "execution opened"
        );
        Ok(execution)
    }

    /// Steps 2-6: agent call, persistence, notification, reschedule. `task`
    /// must be the row as read before `open_execution`, so its
    /// `last_execution_id` still points at the previous firing.
    pub async fn continue_firing(
        &self,
        task: Task,
        execution: TaskExecution,
        kind: FiringKind,
    ) -> AppResult<()> {
        let previous_execution_at = match &task.last_execution_id {
            Some(id) => ExecutionRepository::find_by_id(&self.pool, id)
                .await?
                .map(|e| e.started_at.and_utc().to_rfc3339()),
            None => None,
        };

        let request = AgentRequest {
            task_id: task.id.clone(),
            user_id: task.user_id.clone(),
            search_query: task.search_query.clone(),
            condition_description: task.condition_description.clone(),
            previous_evidence: task.last_known_state.clone(),
            last_execution_at: previous_execution_at,
        };

        match self.agent.invoke(&request, self.agent_timeout).await {
            Ok(envelope) => self.complete_success(task, execution, envelope, kind).await,
            Err(error) => self.complete_failure(task, execution, error, kind).await,
        }
    }

    /// Step 3/4/5: persist the envelope, branch on the condition, reschedule.
    async fn complete_success(
        &self,
        task: Task,
        execution: TaskExecution,
        envelope: AgentEnvelope,
        kind: FiringKind,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        let result_json = serde_json::to_string(&envelope)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("envelope re-encode failed: {e}")))?;
        let sources: Vec<GroundingSource> = envelope
            .sources
            .iter()
            .map(|uri| GroundingSource {
                uri: uri.clone(),
                title: None,
            })
            .collect();

        // Single transaction: execution result + the task's rolling evidence.
        let mut tx = self.pool.begin().await.map_err(AppError::Database)?;
        ExecutionRepository::complete_success(
            &mut *tx,
            &execution.id,
            &result_json,
            envelope.notification.as_deref(),
            &sources,
            now,
        )
        .await?;
        TaskRepository::set_last_known_state(&mut *tx, &task.id, &envelope.evidence).await?;
        tx.commit().await.map_err(AppError::Database)?;

        if let Some(notification) = &envelope.notification {
            tracing::info!(
                task_id = %task.id,
                execution_id = %execution.id,
                confidence = envelope.confidence,
                "condition met"
            );

            let payload = WebhookPayload {
                execution_id: execution.id.clone(),
                task_id: task.id.clone(),
                task_name: task.name.clone(),
                triggered_at: now.and_utc().to_rfc3339(),
                notification: notification.clone(),
                sources: sources.clone(),
                confidence: Some(envelope.confidence),
            };

            if let Err(error) = self
                .dispatcher
                .dispatch(&task.notification_channels, payload)
                .await
            {
                // Delivery retries its own failures; a dispatch error must
                // not abort the firing's lifecycle work.
                tracing::error!(
                    task_id = %task.id,
                    execution_id = %execution.id,
                    %error,
                    "failed to enqueue notifications"
                );
            }

            if task.notify_behavior == NotifyBehavior::Once {
                TaskStateMachine::transition(&self.pool, &task.id, TaskState::Completed).await?;
                // Completion removed the scheduled job; nothing to reschedule.
                return Ok(());
            }
        } else {
            tracing::debug!(
                task_id = %task.id,
                execution_id = %execution.id,
                confidence = envelope.confidence,
                "condition not met"
            );
        }

        self.reschedule(&task, Some(&envelope), kind, execution.started_at).await
    }

    /// Agent failures: record the classification, never notify, never touch
    /// task state, and still reschedule from cron (the agent's `next_run`
    /// recommendation is not trusted on failure paths).
    async fn complete_failure(
        &self,
        task: Task,
        execution: TaskExecution,
        error: AgentError,
        kind: FiringKind,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        let message = format!("{}: {error}", error.kind());

        tracing::warn!(
            task_id = %task.id,
            execution_id = %execution.id,
            kind = error.kind(),
            %error,
            "agent invocation failed"
        );

        ExecutionRepository::complete_failure(&self.pool, &execution.id, &message, now).await?;
        self.reschedule(&task, None, kind, execution.started_at).await
    }

    /// Step 6. Agent-recommended `next_run` wins when it is in the future;
    /// otherwise the cron schedule computed from `max(now, started_at)`.
    /// A pause that landed during the firing wins the race: the job store
    /// refuses to advance paused rows.
    async fn reschedule(
        &self,
        task: &Task,
        envelope: Option<&AgentEnvelope>,
        kind: FiringKind,
        started_at: NaiveDateTime,
    ) -> AppResult<()> {
        if kind == FiringKind::Manual {
            return Ok(());
        }

        let now = Utc::now().naive_utc();
        let next = match envelope.and_then(|e| e.next_run) {
            Some(next_run) if next_run.naive_utc() > now => {
                tracing::info!(
                    task_id = %task.id,
                    next_fire_at = %next_run,
                    "agent-driven reschedule"
                );
                next_run.naive_utc()
            }
            _ => cron::next_fire(&task.schedule, cmp::max(now, started_at))?,
        };

        let advanced = JobStore::reschedule(&self.pool, &task.id, next).await?;
        if !advanced {
            tracing::debug!(
                task_id = %task.id,
                "job paused or removed during firing; reschedule skipped"
            );
        }
        Ok(())
    }
}
