//! Scheduler loop: fires due jobs into a bounded worker pool.
//!
//! Single active loop per deployment. Every firing is authorized by a
//! `claim` on the job store, so a passive replica tailing the same store
//! can never double-fire an instant.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::db::repository::{ExecutionRepository, JobStore};
use crate::error::AppResult;
use crate::services::cron;
use crate::services::notifications::NotificationDispatcher;
use crate::services::orchestrator::ExecutionOrchestrator;

pub struct SchedulerLoop {
    pool: SqlitePool,
    orchestrator: Arc<ExecutionOrchestrator>,
    dispatcher: Arc<NotificationDispatcher>,
    workers: Arc<Semaphore>,
    shutdown: broadcast::Sender<()>,
    tick_interval: Duration,
    batch_limit: i64,
    shutdown_grace: Duration,
    recovery_threshold_seconds: i64,
}

impl std::fmt::Debug for SchedulerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerLoop").finish_non_exhaustive()
    }
}

impl SchedulerLoop {
    pub fn new(
        pool: SqlitePool,
        config: &Config,
        orchestrator: Arc<ExecutionOrchestrator>,
        dispatcher: Arc<NotificationDispatcher>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            pool,
            orchestrator,
            dispatcher,
            workers: Arc::new(Semaphore::new(config.scheduler.worker_pool_size)),
            shutdown,
            tick_interval: Duration::from_millis(config.scheduler.tick_ms),
            batch_limit: config.scheduler.worker_pool_size as i64,
            shutdown_grace: Duration::from_secs(config.scheduler.shutdown_grace_seconds),
            recovery_threshold_seconds: config.scheduler.recovery_threshold_seconds,
        }
    }

    /// Startup sweep: executions stranded in pending/running longer than the
    /// recovery threshold become `failed` with the `crash_recovered` marker.
    /// They are not re-executed; the next scheduled fire runs normally.
    pub async fn recovery_sweep(&self) -> AppResult<u64> {
        let cutoff =
            Utc::now().naive_utc() - chrono::Duration::seconds(self.recovery_threshold_seconds);
        let swept = ExecutionRepository::sweep_stale(&self.pool, cutoff).await?;
        if swept > 0 {
            tracing::warn!(count = swept, "crash recovery sweep marked stranded executions failed");
        }
        Ok(swept)
    }

    /// Run until the shutdown signal fires, then drain in-flight workers for
    /// the grace period. Workers that outlive the grace are abandoned; their
    /// executions stay `running` and the next startup sweep reconciles them.
    pub async fn run(self: Arc<Self>) {
        if let Err(error) = self.recovery_sweep().await {
            tracing::error!(%error, "crash recovery sweep failed");
        }
        match self.dispatcher.resume_pending().await {
            Ok(0) => {}
            Ok(resumed) => tracing::info!(resumed, "resumed interrupted delivery chains"),
            Err(error) => tracing::error!(%error, "failed to resume delivery chains"),
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        tracing::info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            workers = self.batch_limit,
            "scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("scheduler loop received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {}
            }

            self.tick(&mut in_flight).await;
        }

        let drain = futures::future::join_all(in_flight);
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            tracing::warn!(
                grace_secs = self.shutdown_grace.as_secs(),
                "shutdown grace expired; in-flight executions will be crash-recovered on restart"
            );
        }
        tracing::info!("scheduler loop stopped");
    }

    async fn tick(&self, in_flight: &mut Vec<JoinHandle<()>>) {
        in_flight.retain(|handle| !handle.is_finished());

        let now = Utc::now().naive_utc();
        let due = match JobStore::due(&self.pool, now, self.batch_limit).await {
            Ok(due) => due,
            Err(error) => {
                tracing::warn!(%error, "failed to fetch due jobs");
                return;
            }
        };

        for job in due {
            // Back-pressure: take a worker permit before claiming. Jobs we
            // never claim stay due and are picked up on a later tick.
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                tracing::debug!("worker pool saturated, deferring remaining due jobs to next tick");
                break;
            };

            let next_fire_at = match cron::next_fire(&job.cron_expr, now) {
                Ok(next) => next,
                Err(error) => {
                    // The expression can no longer produce a future instant.
                    // Pause the job so it stops churning every tick.
                    tracing::error!(
                        job_id = %job.job_id,
                        cron_expr = %job.cron_expr,
                        %error,
                        "cannot compute next fire time; pausing job"
                    );
                    if let Err(pause_error) = JobStore::pause(&self.pool, &job.job_id).await {
                        tracing::error!(%pause_error, "failed to pause broken job");
                    }
                    continue;
                }
            };

            match JobStore::claim(&self.pool, &job, next_fire_at).await {
                Ok(true) => {
                    let orchestrator = Arc::clone(&self.orchestrator);
                    let job_id = job.job_id.clone();
                    in_flight.push(tokio::spawn(async move {
                        let _permit = permit;
                        match orchestrator.fire_scheduled(&job_id).await {
                            Ok(Some(execution_id)) => {
                                tracing::debug!(
                                    task_id = %job_id,
                                    execution_id = %execution_id,
                                    "firing finished"
                                );
                            }
                            Ok(None) => {
                                tracing::debug!(task_id = %job_id, "firing aborted as no-op");
                            }
                            Err(error) => {
                                tracing::warn!(task_id = %job_id, %error, "firing failed");
                            }
                        }
                    }));
                }
                Ok(false) => {
                    tracing::debug!(job_id = %job.job_id, "lost claim race, skipping");
                }
                Err(error) => {
                    tracing::warn!(job_id = %job.job_id, %error, "claim failed");
                }
            }
        }
    }
}
