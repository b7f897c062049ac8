use std::time::Duration;

use crate::error::Result;
use crate::models::notification::Notification;
use crate::models::webhook_log::WebhookLog;
use crate::utils::crypto::hmac_sha256_hex;
use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;
use uuid::Uuid;

pub const KIND_BADGE_EARNED: &str = "badge_earned";
pub const KIND_CERTIFICATE_ISSUED: &str = "certificate_issued";
pub const KIND_COURSE_COMPLETED: &str = "course_completed";
pub const KIND_ASSESSMENT_RESULT: &str = "assessment_result";

pub const SIGNATURE_HEADER: &str = "X-VX-Signature";

const DELIVERY_TIMEOUT_SECS: u64 = 30;
/// Rows left in `delivering` longer than this belong to a worker that died.
const STALE_DELIVERY_SECS: u64 = 300;

/// Seconds to wait before retry number `attempts + 1`: 30s doubling, capped at an hour.
pub fn retry_delay_secs(attempts: i32) -> i64 {
    let exp = (attempts - 1).clamp(0, 16) as u32;
    (30i64 * 2i64.pow(exp)).min(3600)
}

#[derive(Clone)]
pub struct NotificationService {
    pool: PgPool,
    client: Client,
    target_url: Option<String>,
    secret: String,
}

impl NotificationService {
    pub fn new(pool: PgPool, target_url: Option<String>, secret: String) -> Self {
        Self {
            pool,
            client: Client::builder()
                .timeout(Duration::from_secs(DELIVERY_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            target_url,
            secret,
        }
    }

    /// Stores an in-app notification and mirrors it to the outbound webhook, if configured.
    pub async fn notify(
        &self,
        user_id: Uuid,
        kind: &str,
        title: &str,
        body: &str,
        data: Option<JsonValue>,
    ) -> Result<Notification> {
        let notification = sqlx::query_as::<_, Notification>(
            r#"INSERT INTO notifications (user_id, kind, title, body, data)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING *"#,
        )
        .bind(user_id)
        .bind(kind)
        .bind(title)
        .bind(body)
        .bind(&data)
        .fetch_one(&self.pool)
        .await?;

        if self.target_url.is_some() {
            let payload = json!({
                "event": kind,
                "user_id": user_id,
                "title": title,
                "body": body,
                "data": data,
                "created_at": notification.created_at,
            });
            self.enqueue_webhook(kind, &payload).await?;
        }

        Ok(notification)
    }

    pub async fn list(&self, user_id: Uuid, unread_only: bool, limit: i64) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, Notification>(
            r#"SELECT * FROM notifications
               WHERE user_id = $1 AND (NOT $2 OR is_read = FALSE)
               ORDER BY created_at DESC
               LIMIT $3"#,
        )
        .bind(user_id)
        .bind(unread_only)
        .bind(limit.clamp(1, 200))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn mark_read(&self, user_id: Uuid, notification_id: Uuid) -> Result<Notification> {
        let row = sqlx::query_as::<_, Notification>(
            r#"UPDATE notifications SET is_read = TRUE
               WHERE id = $1 AND user_id = $2
               RETURNING *"#,
        )
        .bind(notification_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn mark_all_read(&self, user_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"UPDATE notifications SET is_read = TRUE WHERE user_id = $1 AND is_read = FALSE"#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn unread_count(&self, user_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND is_read = FALSE"#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn enqueue_webhook(&self, event_type: &str, payload: &JsonValue) -> Result<Option<WebhookLog>> {
        let Some(target_url) = self.target_url.as_ref() else {
            return Ok(None);
        };
        let row = sqlx::query_as::<_, WebhookLog>(
            r#"INSERT INTO webhook_logs (event_type, payload, target_url, status)
               VALUES ($1, $2, $3, 'pending')
               RETURNING *"#,
        )
        .bind(event_type)
        .bind(payload)
        .bind(target_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(row))
    }

    pub async fn deliver_once(&self, log_id: Uuid) -> Result<()> {
        let log = sqlx::query_as::<_, WebhookLog>(r#"SELECT * FROM webhook_logs WHERE id = $1"#)
            .bind(log_id)
            .fetch_one(&self.pool)
            .await?;

        let body = serde_json::to_vec(&log.payload)?;
        let signature = hmac_sha256_hex(self.secret.as_bytes(), &body);
        let res = self
            .client
            .post(&log.target_url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await;
        match res {
            Ok(resp) => {
                let status = i32::from(resp.status().as_u16());
                let body = resp.text().await.unwrap_or_default();
                sqlx::query(
                    r#"UPDATE webhook_logs
                       SET http_status = $1, response_body = $2,
                           status = CASE WHEN $1 BETWEEN 200 AND 299 THEN 'success' ELSE 'failed' END,
                           attempts = attempts + 1, updated_at = NOW()
                       WHERE id = $3"#,
                )
                .bind(status)
                .bind(body)
                .bind(log.id)
                .execute(&self.pool)
                .await?;
            }
            Err(err) => {
                tracing::warn!(webhook_id = %log.id, error = %err, "webhook delivery failed");
                sqlx::query(
                    r#"UPDATE webhook_logs
                       SET response_body = $1, status = 'failed', attempts = attempts + 1, updated_at = NOW()
                       WHERE id = $2"#,
                )
                .bind(err.to_string())
                .bind(log.id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Puts deliveries abandoned mid-flight back in the queue.
    pub async fn reclaim_stale(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"UPDATE webhook_logs
               SET status = 'pending', next_retry_at = NULL, updated_at = NOW()
               WHERE status = 'delivering' AND updated_at <= NOW() - make_interval(secs => $1)"#,
        )
        .bind(STALE_DELIVERY_SECS as f64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            tracing::warn!(reclaimed = result.rows_affected(), "stale webhook deliveries requeued");
        }
        Ok(result.rows_affected())
    }

    /// Delivers one due webhook. Returns `false` when the queue is empty.
    pub async fn run_once(&self) -> Result<bool> {
        let next: Option<Uuid> = sqlx::query_scalar(
            r#"UPDATE webhook_logs SET status = 'delivering', updated_at = NOW()
               WHERE id = (
                   SELECT id FROM webhook_logs
                   WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                   ORDER BY created_at ASC
                   LIMIT 1
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING id"#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(id) = next else { return Ok(false) };

        if let Err(e) = self.deliver_once(id).await {
            tracing::error!(webhook_id = %id, error = ?e, "webhook bookkeeping failed");
        }

        let (attempts, max_attempts, status): (i32, i32, String) = sqlx::query_as(
            r#"SELECT attempts, max_attempts, status FROM webhook_logs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        if status != "success" && attempts < max_attempts {
            sqlx::query(
                r#"UPDATE webhook_logs
                   SET status = 'pending', next_retry_at = NOW() + make_interval(secs => $2)
                   WHERE id = $1"#,
            )
            .bind(id)
            .bind(retry_delay_secs(attempts) as f64)
            .execute(&self.pool)
            .await?;
        } else if status != "success" {
            tracing::warn!(webhook_id = %id, attempts, "webhook gave up");
            sqlx::query(r#"UPDATE webhook_logs SET status = 'failed' WHERE id = $1"#)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_delay_secs(1), 30);
        assert_eq!(retry_delay_secs(2), 60);
        assert_eq!(retry_delay_secs(3), 120);
        assert_eq!(retry_delay_secs(0), 30);
        assert_eq!(retry_delay_secs(10), 3600);
        assert_eq!(retry_delay_secs(100), 3600);
    }
}
