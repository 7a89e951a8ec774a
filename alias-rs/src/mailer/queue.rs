//! Outbound queue with retry bookkeeping
//!
//! Routing only enqueues; an external worker drains the queue, performs the
//! SMTP transaction and reports back through [`OutboundQueue::mark_sent`] or
//! [`OutboundQueue::mark_failed`].
//!
//! # Architecture
//! ```text
//! ┌─────────┐
//! │ Enqueue │ → [outbound_queue] → [Worker] → ✓ mark_sent
//! └─────────┘        ↑                ↓
//!                    └── mark_failed ←┘ → (max retries) → bounced
//! ```

use super::PayloadCipher;
use crate::error::{AliasError, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Maximum number of retry attempts before giving up
const DEFAULT_MAX_RETRIES: i32 = 5;

/// Base delay for retry (2 minutes)
const DEFAULT_RETRY_BASE_DELAY_SECS: i64 = 120;

const QUEUE_COLUMNS: &str = "id, kind, user_id, alias_id, from_addr, recipients, data, \
     encrypted, status, retry_count, last_error, original_sender, original_subject, \
     created_at, next_retry_at";

/// What a queued job carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Forward,
    Notification,
}

impl JobKind {
    fn as_str(&self) -> &'static str {
        match self {
            JobKind::Forward => "forward",
            JobKind::Notification => "notification",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "forward" => JobKind::Forward,
            _ => JobKind::Notification,
        }
    }
}

/// Queue entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Pending,
    Sent,
    Bounced,
}

impl QueueStatus {
    fn parse(value: &str) -> Self {
        match value {
            "sent" => QueueStatus::Sent,
            "bounced" => QueueStatus::Bounced,
            _ => QueueStatus::Pending,
        }
    }
}

/// A job to put on the queue
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundJob {
    pub kind: JobKind,
    pub user_id: Uuid,
    pub alias_id: Option<Uuid>,
    pub from_addr: String,
    pub recipients: Vec<String>,
    /// Rendered message (headers + body)
    pub data: Vec<u8>,
    pub original_sender: Option<String>,
    pub original_subject: Option<String>,
}

/// A queued email as seen by the worker; `job.data` is always plaintext
#[derive(Debug, Clone)]
pub struct QueuedEmail {
    pub id: String,
    pub job: OutboundJob,
    pub status: QueueStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Outcome of a failed delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { next_retry_at: DateTime<Utc> },
    Bounced,
}

/// SQLite-backed outbound queue
pub struct OutboundQueue {
    db: SqlitePool,
    cipher: Option<Arc<PayloadCipher>>,
    max_retries: i32,
    retry_base_delay_secs: i64,
}

impl OutboundQueue {
    pub fn new(db: SqlitePool, cipher: Option<PayloadCipher>) -> Self {
        Self {
            db,
            cipher: cipher.map(Arc::new),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_secs: DEFAULT_RETRY_BASE_DELAY_SECS,
        }
    }

    pub fn with_retry_policy(mut self, max_retries: i32, retry_base_delay_secs: i64) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay_secs = retry_base_delay_secs;
        self
    }

    pub async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbound_queue (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                user_id TEXT NOT NULL,
                alias_id TEXT,
                from_addr TEXT NOT NULL,
                recipients TEXT NOT NULL,
                data BLOB NOT NULL,
                encrypted INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                original_sender TEXT,
                original_subject TEXT,
                created_at TEXT NOT NULL,
                next_retry_at TEXT
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbound_queue_pending
            ON outbound_queue(status, next_retry_at)
            "#,
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Enqueue a job, sealing its payload when a cipher is configured
    ///
    /// # Returns
    /// ID of the queued email
    pub async fn enqueue(&self, job: &OutboundJob) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = timestamp(Utc::now());

        let (data, encrypted) = match &self.cipher {
            Some(cipher) => (cipher.seal(&job.data)?, true),
            None => (job.data.clone(), false),
        };

        info!(
            "Enqueuing {} from {} to {} recipient(s): {}",
            job.kind.as_str(),
            job.from_addr,
            job.recipients.len(),
            id
        );

        sqlx::query(
            r#"
            INSERT INTO outbound_queue (
                id, kind, user_id, alias_id, from_addr, recipients, data, encrypted,
                status, retry_count, original_sender, original_subject, created_at, next_retry_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(job.kind.as_str())
        .bind(job.user_id.to_string())
        .bind(job.alias_id.map(|a| a.to_string()))
        .bind(&job.from_addr)
        .bind(serde_json::to_string(&job.recipients)?)
        .bind(data)
        .bind(encrypted)
        .bind(&job.original_sender)
        .bind(&job.original_subject)
        .bind(&now)
        .bind(&now)
        .execute(&self.db)
        .await?;

        Ok(id)
    }

    /// Get pending emails ready for sending
    pub async fn get_pending(&self, limit: i64) -> Result<Vec<QueuedEmail>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM outbound_queue \
             WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?) \
             ORDER BY created_at ASC LIMIT ?",
            QUEUE_COLUMNS
        ))
        .bind(timestamp(Utc::now()))
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(|row| self.row_to_email(row)).collect()
    }

    pub async fn find(&self, id: &str) -> Result<Option<QueuedEmail>> {
        let row = sqlx::query(&format!("SELECT {} FROM outbound_queue WHERE id = ?", QUEUE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(|row| self.row_to_email(row)).transpose()
    }

    /// Mark email as sent
    pub async fn mark_sent(&self, id: &str) -> Result<()> {
        info!("Marking email {} as sent", id);

        sqlx::query("UPDATE outbound_queue SET status = 'sent' WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Record a failed attempt and schedule a retry, or bounce once retries
    /// are exhausted
    pub async fn mark_failed(
        &self,
        id: &str,
        error_msg: &str,
        retry_count: i32,
    ) -> Result<RetryDecision> {
        if retry_count >= self.max_retries {
            warn!("Email {} exceeded max retries, marking as bounced", id);
            self.mark_bounced(id, error_msg).await?;
            return Ok(RetryDecision::Bounced);
        }

        // Exponential backoff
        let exponent = u32::try_from(retry_count).unwrap_or(0);
        let delay_secs = self
            .retry_base_delay_secs
            .saturating_mul(2_i64.saturating_pow(exponent));
        let next_retry = Utc::now() + Duration::seconds(delay_secs);

        info!(
            "Marking email {} as failed (attempt {}), next retry at {}",
            id,
            retry_count + 1,
            next_retry
        );

        sqlx::query(
            r#"
            UPDATE outbound_queue
            SET status = 'pending',
                retry_count = ?,
                last_error = ?,
                next_retry_at = ?
            WHERE id = ?
            "#,
        )
        .bind(retry_count + 1)
        .bind(error_msg)
        .bind(timestamp(next_retry))
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(RetryDecision::Retry {
            next_retry_at: next_retry,
        })
    }

    /// Mark email as permanently bounced
    pub async fn mark_bounced(&self, id: &str, error_msg: &str) -> Result<()> {
        error!("Email {} bounced: {}", id, error_msg);

        sqlx::query(
            r#"
            UPDATE outbound_queue
            SET status = 'bounced',
                last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(error_msg)
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    fn row_to_email(&self, row: &SqliteRow) -> Result<QueuedEmail> {
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        let user_id: String = row.try_get("user_id")?;
        let alias_id: Option<String> = row.try_get("alias_id")?;
        let recipients: String = row.try_get("recipients")?;
        let data: Vec<u8> = row.try_get("data")?;
        let encrypted: bool = row.try_get("encrypted")?;
        let created_at: String = row.try_get("created_at")?;
        let next_retry_at: Option<String> = row.try_get("next_retry_at")?;

        let data = if encrypted {
            self.cipher
                .as_ref()
                .ok_or_else(|| {
                    AliasError::Crypto("sealed payload but no key configured".to_string())
                })?
                .open(&data)?
        } else {
            data
        };

        Ok(QueuedEmail {
            id: row.try_get("id")?,
            job: OutboundJob {
                kind: JobKind::parse(&kind),
                user_id: Uuid::parse_str(&user_id).map_err(|e| AliasError::Parse(e.to_string()))?,
                alias_id: alias_id
                    .map(|a| Uuid::parse_str(&a))
                    .transpose()
                    .map_err(|e| AliasError::Parse(e.to_string()))?,
                from_addr: row.try_get("from_addr")?,
                recipients: serde_json::from_str(&recipients)?,
                data,
                original_sender: row.try_get("original_sender")?,
                original_subject: row.try_get("original_subject")?,
            },
            status: QueueStatus::parse(&status),
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
            created_at: parse_timestamp(&created_at)?,
            next_retry_at: next_retry_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AliasError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::connect;

    async fn setup_queue(cipher: Option<PayloadCipher>) -> (OutboundQueue, SqlitePool) {
        let pool = connect("sqlite::memory:").await.unwrap();
        let queue = OutboundQueue::new(pool.clone(), cipher);
        queue.init_db().await.unwrap();
        (queue, pool)
    }

    fn job() -> OutboundJob {
        OutboundJob {
            kind: JobKind::Forward,
            user_id: Uuid::from_u128(1),
            alias_id: Some(Uuid::from_u128(2)),
            from_addr: "ebay@johndoe.anonaddy.me".to_string(),
            recipients: vec!["one@example.com".to_string(), "two@example.com".to_string()],
            data: b"Subject: Test\r\n\r\nHello!".to_vec(),
            original_sender: Some("will@anonaddy.com".to_string()),
            original_subject: Some("Test".to_string()),
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_get_pending() {
        let (queue, _pool) = setup_queue(None).await;
        let id = queue.enqueue(&job()).await.unwrap();

        let pending = queue.get_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].job, job());
        assert_eq!(pending[0].status, QueueStatus::Pending);
        assert_eq!(pending[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_mark_sent_removes_from_pending() {
        let (queue, _pool) = setup_queue(None).await;
        let id = queue.enqueue(&job()).await.unwrap();

        queue.mark_sent(&id).await.unwrap();

        assert!(queue.get_pending(10).await.unwrap().is_empty());
        assert_eq!(queue.find(&id).await.unwrap().unwrap().status, QueueStatus::Sent);
    }

    #[tokio::test]
    async fn test_retry_then_bounce() {
        let (queue, _pool) = setup_queue(None).await;
        let queue = queue.with_retry_policy(2, 60);
        let id = queue.enqueue(&job()).await.unwrap();

        let decision = queue.mark_failed(&id, "connection refused", 0).await.unwrap();
        assert!(matches!(decision, RetryDecision::Retry { .. }));

        // Backed off into the future
        assert!(queue.get_pending(10).await.unwrap().is_empty());
        let stored = queue.find(&id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("connection refused"));

        let decision = queue.mark_failed(&id, "mailbox full", 2).await.unwrap();
        assert_eq!(decision, RetryDecision::Bounced);
        assert_eq!(queue.find(&id).await.unwrap().unwrap().status, QueueStatus::Bounced);
    }

    #[tokio::test]
    async fn test_payload_is_sealed_at_rest() {
        let cipher = PayloadCipher::new(&[3u8; 32]).unwrap();
        let (queue, pool) = setup_queue(Some(cipher)).await;
        let id = queue.enqueue(&job()).await.unwrap();

        let stored: Vec<u8> = sqlx::query_scalar("SELECT data FROM outbound_queue WHERE id = ?")
            .bind(&id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_ne!(stored, job().data);

        let pending = queue.get_pending(10).await.unwrap();
        assert_eq!(pending[0].job.data, job().data);
    }
}
