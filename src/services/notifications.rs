//! Notification dispatcher: at-least-once delivery with per-chain retries.
//!
//! A "chain" is the serial sequence of attempts for one (execution,
//! recipient) pair. Chains run concurrently with each other; within a chain
//! every attempt is recorded as its own row, so an interrupted chain can be
//! resumed from the delivery log after a restart.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use rand::Rng;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{Config, WebhookRetryConfig};
use crate::db::models::{
    ChannelType, DeliveryStatus, NotificationChannel, RecordDeliveryAttempt,
};
use crate::db::repository::{DeliveryRepository, ExecutionRepository, TaskRepository};
use crate::error::AppResult;
use crate::services::email::{self, EmailSender};
use crate::services::webhook::{WebhookPayload, WebhookSender};

/// Classified result of one channel send.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Delivered {
        http_status: Option<i64>,
    },
    /// Worth retrying: 5xx/408/429, network errors, SMTP 4xx.
    Transient {
        http_status: Option<i64>,
        error: String,
    },
    /// Retrying cannot help: other 4xx, invalid addresses, bad channel config.
    Permanent {
        http_status: Option<i64>,
        error: String,
    },
}

/// Exponential backoff with jitter, shared by both channels.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &WebhookRetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            jitter: config.jitter,
        }
    }

    /// Delay before the retry that follows `attempt` (1-based):
    /// `initial * 2^(attempt-1)`, capped, with ±jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = (self.initial_backoff.as_millis() as u64)
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff.as_millis() as u64);

        let spread = self.jitter.clamp(0.0, 1.0);
        let factor = if spread > 0.0 {
            rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread)
        } else {
            1.0
        };

        Duration::from_millis(((base_ms as f64) * factor).round() as u64)
    }
}

/// Handle to the chains spawned by one `dispatch` call. Delivery continues
/// in the background; callers only join this in tests and shutdown paths.
#[derive(Debug)]
pub struct DeliveryBatch {
    pub execution_id: String,
    pub handles: Vec<JoinHandle<()>>,
}

pub struct NotificationDispatcher {
    pool: SqlitePool,
    webhook: WebhookSender,
    email: Option<EmailSender>,
    retry: RetryPolicy,
    shutdown: broadcast::Sender<()>,
    /// Chains currently running in this process, for double-dispatch
    /// coalescing. Keyed by (execution_id, recipient).
    active: Mutex<HashSet<(String, String)>>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher").finish_non_exhaustive()
    }
}

impl NotificationDispatcher {
    pub fn new(
        pool: SqlitePool,
        config: &Config,
        shutdown: broadcast::Sender<()>,
    ) -> AppResult<Self> {
        Ok(Self {
            pool,
            webhook: WebhookSender::new()?,
            email: EmailSender::from_config(&config.email)?,
            retry: RetryPolicy::from_config(&config.webhook_retry),
            shutdown,
            active: Mutex::new(HashSet::new()),
        })
    }

    /// Enqueue delivery through every configured channel and return
    /// immediately. Chains that are already terminal or already running are
    /// coalesced into no-ops, never duplicated.
    pub async fn dispatch(
        self: &Arc<Self>,
        channels: &[NotificationChannel],
        payload: WebhookPayload,
    ) -> AppResult<DeliveryBatch> {
        let execution_id = payload.execution_id.clone();
        let mut handles = Vec::new();

        for channel in channels {
            let recipient = channel.recipient().to_string();

            if !self.begin_chain(&execution_id, &recipient) {
                tracing::debug!(
                    execution_id = %execution_id,
                    recipient = %recipient,
                    "delivery chain already running, coalescing dispatch"
                );
                continue;
            }

            let start_attempt = match DeliveryRepository::latest_attempt(
                &self.pool,
                &execution_id,
                &recipient,
            )
            .await
            {
                Ok(Some(latest)) if latest.status.is_terminal() => {
                    tracing::debug!(
                        execution_id = %execution_id,
                        recipient = %recipient,
                        status = ?latest.status,
                        "delivery already terminal, skipping"
                    );
                    self.end_chain(&execution_id, &recipient);
                    continue;
                }
                Ok(Some(latest)) => latest.attempt + 1,
                Ok(None) => 1,
                Err(error) => {
                    tracing::warn!(%error, "failed to read delivery chain, starting fresh");
                    self.end_chain(&execution_id, &recipient);
                    continue;
                }
            };

            let dispatcher = Arc::clone(self);
            let channel = channel.clone();
            let payload = payload.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.run_chain(channel, payload, start_attempt, None).await;
            }));
        }

        Ok(DeliveryBatch {
            execution_id,
            handles,
        })
    }

    /// Reload chains that were interrupted mid-retry and continue them.
    /// Called once at startup, before the scheduler starts firing.
    pub async fn resume_pending(self: &Arc<Self>) -> AppResult<usize> {
        let pending = DeliveryRepository::pending_retries(&self.pool).await?;
        let mut resumed = 0;

        for row in pending {
            let Some(execution) =
                ExecutionRepository::find_by_id(&self.pool, &row.execution_id).await?
            else {
                continue;
            };
            let Some(notification) = execution.notification.clone() else {
                continue;
            };

            let task = TaskRepository::find_by_id(&self.pool, &execution.task_id).await?;
            let channel = task
                .as_ref()
                .and_then(|t| {
                    t.notification_channels
                        .iter()
                        .find(|c| c.recipient() == row.recipient)
                        .cloned()
                })
                // Task deleted or channel removed since: rebuild enough of the
                // channel from the delivery row to finish the chain.
                .unwrap_or_else(|| fallback_channel(row.channel_type, &row.recipient));

            let confidence = execution
                .result
                .as_deref()
                .and_then(|r| serde_json::from_str::<serde_json::Value>(r).ok())
                .and_then(|v| v.get("confidence").and_then(|c| c.as_i64()));
            let triggered_at = execution.completed_at.unwrap_or(execution.started_at);

            let payload = WebhookPayload {
                execution_id: execution.id.clone(),
                task_id: execution.task_id.clone(),
                task_name: task.map(|t| t.name).unwrap_or_default(),
                triggered_at: triggered_at.and_utc().to_rfc3339(),
                notification,
                sources: execution.grounding_sources.0.clone(),
                confidence,
            };

            if !self.begin_chain(&execution.id, &row.recipient) {
                continue;
            }

            tracing::info!(
                execution_id = %execution.id,
                recipient = %row.recipient,
                attempt = row.attempt + 1,
                "resuming interrupted delivery chain"
            );

            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                dispatcher
                    .run_chain(channel, payload, row.attempt + 1, row.next_retry_at)
                    .await;
            });
            resumed += 1;
        }

        Ok(resumed)
    }

    /// Serial attempt loop for one (execution, recipient) chain.
    async fn run_chain(
        self: Arc<Self>,
        channel: NotificationChannel,
        payload: WebhookPayload,
        start_attempt: i64,
        resume_at: Option<NaiveDateTime>,
    ) {
        let execution_id = payload.execution_id.clone();
        let recipient = channel.recipient().to_string();
        let channel_type = match &channel {
            NotificationChannel::Email { .. } => ChannelType::Email,
            NotificationChannel::Webhook { .. } => ChannelType::Webhook,
        };
        let mut shutdown_rx = self.shutdown.subscribe();

        // A resumed chain honors the delay persisted before the interruption.
        if let Some(due) = resume_at {
            let wait = (due - Utc::now().naive_utc()).to_std().unwrap_or_default();
            if !wait.is_zero() {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        self.end_chain(&execution_id, &recipient);
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        let max_attempts = self.retry.max_attempts as i64;
        let mut attempt = start_attempt;

        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            let outcome = self.send_once(&channel, &payload).await;

            match outcome {
                SendOutcome::Delivered { http_status } => {
                    self.record(
                        &execution_id,
                        channel_type,
                        &recipient,
                        DeliveryStatus::Success,
                        http_status,
                        attempt,
                        None,
                        None,
                    )
                    .await;
                    tracing::info!(
                        execution_id = %execution_id,
                        recipient = %recipient,
                        attempt,
                        "notification delivered"
                    );
                    break;
                }
                SendOutcome::Permanent { http_status, error } => {
                    self.record(
                        &execution_id,
                        channel_type,
                        &recipient,
                        DeliveryStatus::Failed,
                        http_status,
                        attempt,
                        None,
                        Some(error.clone()),
                    )
                    .await;
                    tracing::warn!(
                        execution_id = %execution_id,
                        recipient = %recipient,
                        attempt,
                        %error,
                        "notification failed permanently"
                    );
                    break;
                }
                SendOutcome::Transient { http_status, error } => {
                    if attempt >= max_attempts {
                        self.record(
                            &execution_id,
                            channel_type,
                            &recipient,
                            DeliveryStatus::Failed,
                            http_status,
                            attempt,
                            None,
                            Some(error.clone()),
                        )
                        .await;
                        tracing::warn!(
                            execution_id = %execution_id,
                            recipient = %recipient,
                            attempt,
                            %error,
                            "notification failed after exhausting retries"
                        );
                        break;
                    }

                    let delay = self.retry.delay_for(attempt as u32);
                    let next_retry_at = Utc::now().naive_utc()
                        + chrono::Duration::from_std(delay).unwrap_or_default();

                    self.record(
                        &execution_id,
                        channel_type,
                        &recipient,
                        DeliveryStatus::Retrying,
                        http_status,
                        attempt,
                        Some(next_retry_at),
                        Some(error.clone()),
                    )
                    .await;
                    tracing::debug!(
                        execution_id = %execution_id,
                        recipient = %recipient,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "delivery attempt failed, retrying"
                    );

                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            // The retrying row is already persisted; the next
                            // startup's resume pass continues from here.
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }

        self.end_chain(&execution_id, &recipient);
    }

    async fn send_once(
        &self,
        channel: &NotificationChannel,
        payload: &WebhookPayload,
    ) -> SendOutcome {
        match channel {
            NotificationChannel::Email { address } => match &self.email {
                Some(sender) => {
                    let (subject, body) = email::render_alert(
                        &payload.task_name,
                        &payload.notification,
                        &payload.sources,
                    );
                    sender.send(address, &subject, &body).await
                }
                None => SendOutcome::Permanent {
                    http_status: None,
                    error: "email channel not configured (EMAIL_SMTP_* unset)".to_string(),
                },
            },
            NotificationChannel::Webhook {
                url,
                method,
                headers,
            } => self.webhook.send(url, *method, headers, payload).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        execution_id: &str,
        channel_type: ChannelType,
        recipient: &str,
        status: DeliveryStatus,
        http_status: Option<i64>,
        attempt: i64,
        next_retry_at: Option<NaiveDateTime>,
        error_message: Option<String>,
    ) {
        let result = DeliveryRepository::record_attempt(
            &self.pool,
            RecordDeliveryAttempt {
                execution_id: execution_id.to_string(),
                channel_type,
                recipient: recipient.to_string(),
                status,
                http_status,
                attempt,
                next_retry_at,
                error_message,
            },
        )
        .await;

        if let Err(error) = result {
            tracing::error!(
                execution_id = %execution_id,
                recipient = %recipient,
                attempt,
                %error,
                "failed to persist delivery attempt"
            );
        }
    }

    fn begin_chain(&self, execution_id: &str, recipient: &str) -> bool {
        let mut active = self.active.lock().expect("delivery chain set poisoned");
        active.insert((execution_id.to_string(), recipient.to_string()))
    }

    fn end_chain(&self, execution_id: &str, recipient: &str) {
        let mut active = self.active.lock().expect("delivery chain set poisoned");
        active.remove(&(execution_id.to_string(), recipient.to_string()));
    }
}

fn fallback_channel(channel_type: ChannelType, recipient: &str) -> NotificationChannel {
    match channel_type {
        ChannelType::Email => NotificationChannel::Email {
            address: recipient.to_string(),
        },
        ChannelType::Webhook => NotificationChannel::Webhook {
            url: recipient.to_string(),
            method: Default::default(),
            headers: Default::default(),
        },
    }
}
