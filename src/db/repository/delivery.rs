use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{NotificationDelivery, RecordDeliveryAttempt};
use crate::error::{AppError, AppResult};

const DELIVERY_COLUMNS: &str = r#"
    id, execution_id, channel_type, recipient, status, http_status,
    attempt, next_retry_at, error_message, created_at, updated_at
"#;

pub struct DeliveryRepository;

impl DeliveryRepository {
    /// Record one resolved delivery attempt as a new row in the chain.
    pub async fn record_attempt(
        pool: &SqlitePool,
        attempt: RecordDeliveryAttempt,
    ) -> AppResult<NotificationDelivery> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            INSERT INTO notification_deliveries (
                id, execution_id, channel_type, recipient, status, http_status,
                attempt, next_retry_at, error_message, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {DELIVERY_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(attempt.execution_id)
        .bind(attempt.channel_type)
        .bind(attempt.recipient)
        .bind(attempt.status)
        .bind(attempt.http_status)
        .bind(attempt.attempt)
        .bind(attempt.next_retry_at)
        .bind(attempt.error_message)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    /// The most recent attempt for one (execution, recipient) chain.
    pub async fn latest_attempt(
        pool: &SqlitePool,
        execution_id: &str,
        recipient: &str,
    ) -> AppResult<Option<NotificationDelivery>> {
        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            SELECT {DELIVERY_COLUMNS} FROM notification_deliveries
            WHERE execution_id = ? AND recipient = ?
            ORDER BY attempt DESC
            LIMIT 1
            "#
        ))
        .bind(execution_id)
        .bind(recipient)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Full attempt history for an execution, grouped per chain.
    pub async fn list_for_execution(
        pool: &SqlitePool,
        execution_id: &str,
    ) -> AppResult<Vec<NotificationDelivery>> {
        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            SELECT {DELIVERY_COLUMNS} FROM notification_deliveries
            WHERE execution_id = ?
            ORDER BY recipient, attempt
            "#
        ))
        .bind(execution_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Chains interrupted mid-retry: the newest attempt per (execution,
    /// recipient) that is still `retrying`. Used by the startup resume pass.
    pub async fn pending_retries(pool: &SqlitePool) -> AppResult<Vec<NotificationDelivery>> {
        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            SELECT {DELIVERY_COLUMNS} FROM notification_deliveries AS d
            WHERE d.status = 'retrying'
              AND d.attempt = (
                  SELECT MAX(attempt) FROM notification_deliveries
                  WHERE execution_id = d.execution_id AND recipient = d.recipient
              )
            ORDER BY d.next_retry_at
            "#
        ))
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ChannelType, DeliveryStatus};
    use crate::testutil::test_pool;
    use chrono::Duration;

    fn attempt(
        execution_id: &str,
        recipient: &str,
        status: DeliveryStatus,
        n: i64,
    ) -> RecordDeliveryAttempt {
        RecordDeliveryAttempt {
            execution_id: execution_id.to_string(),
            channel_type: ChannelType::Webhook,
            recipient: recipient.to_string(),
            status,
            http_status: None,
            attempt: n,
            next_retry_at: match status {
                DeliveryStatus::Retrying => Some(Utc::now().naive_utc() + Duration::seconds(1)),
                _ => None,
            },
            error_message: None,
        }
    }

    #[tokio::test]
    async fn latest_attempt_follows_the_chain() {
        let pool = test_pool().await;

        DeliveryRepository::record_attempt(
            &pool,
            attempt("exec-1", "https://a.test", DeliveryStatus::Retrying, 1),
        )
        .await
        .unwrap();
        DeliveryRepository::record_attempt(
            &pool,
            attempt("exec-1", "https://a.test", DeliveryStatus::Success, 2),
        )
        .await
        .unwrap();

        let latest = DeliveryRepository::latest_attempt(&pool, "exec-1", "https://a.test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.attempt, 2);
        assert_eq!(latest.status, DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn pending_retries_only_surface_unfinished_chains() {
        let pool = test_pool().await;

        // Chain A ended in success after one retry.
        DeliveryRepository::record_attempt(
            &pool,
            attempt("exec-1", "https://a.test", DeliveryStatus::Retrying, 1),
        )
        .await
        .unwrap();
        DeliveryRepository::record_attempt(
            &pool,
            attempt("exec-1", "https://a.test", DeliveryStatus::Success, 2),
        )
        .await
        .unwrap();

        // Chain B was interrupted while retrying.
        DeliveryRepository::record_attempt(
            &pool,
            attempt("exec-2", "https://b.test", DeliveryStatus::Retrying, 1),
        )
        .await
        .unwrap();

        let pending = DeliveryRepository::pending_retries(&pool).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].execution_id, "exec-2");
        assert_eq!(pending[0].attempt, 1);
    }
}
