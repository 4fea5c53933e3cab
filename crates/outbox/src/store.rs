//! SQLite-backed outbox persistence.
//!
//! The table is the durability boundary between "accepted for sending"
//! and "actually delivered". Workers claim rows by a conditional UPDATE
//! on the row itself, so no cross-worker lock exists.

use {
    anyhow::{Context, Result},
    chrono::{DateTime, Utc},
    sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions, sqlite::SqliteRow},
};

use {
    switchboard_channels::{ChannelType, SendRequest},
    switchboard_common::time::{from_ms, now_ms},
};

use crate::types::{OutboxMessage, OutboxStatus};

/// Store over the `outbox_messages` table.
#[derive(Clone)]
pub struct OutboxStore {
    pool: SqlitePool,
}

/// Result of an enqueue call.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub entry: OutboxMessage,
    /// False when the idempotency key already existed and the prior entry
    /// (possibly already sent) was returned instead.
    pub created: bool,
}

impl OutboxStore {
    /// Create a store with its own pool and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("failed to connect to SQLite")?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Create a store over a shared pool; call [`run_migrations`] first.
    #[must_use]
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Durably enqueue a send request.
    ///
    /// Idempotent on the caller-supplied key: a repeated enqueue returns
    /// the existing entry without creating a duplicate, including entries
    /// that already reached a terminal state.
    pub async fn enqueue(
        &self,
        request: &SendRequest,
        idempotency_key: &str,
        priority: i64,
    ) -> Result<Enqueued> {
        if idempotency_key.trim().is_empty() {
            anyhow::bail!("idempotency key must not be empty");
        }

        if let Some(existing) = self.get_by_idempotency_key(idempotency_key).await? {
            return Ok(Enqueued {
                entry: existing,
                created: false,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_string(request)?;
        let now = now_ms();

        let result = sqlx::query(
            "INSERT INTO outbox_messages
                (id, conversation_id, channel, status, attempts, next_attempt_at,
                 payload, idempotency_key, priority, created_at, updated_at)
             VALUES (?, ?, ?, 'queued', 0, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(idempotency_key) DO NOTHING",
        )
        .bind(&id)
        .bind(&request.conversation_id)
        .bind(request.channel.as_str())
        .bind(now)
        .bind(&payload)
        .bind(idempotency_key)
        .bind(priority)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to enqueue outbox message")?;

        let created = result.rows_affected() == 1;
        let entry = self
            .get_by_idempotency_key(idempotency_key)
            .await?
            .context("outbox entry vanished after enqueue")?;
        Ok(Enqueued { entry, created })
    }

    pub async fn get(&self, id: &str) -> Result<Option<OutboxMessage>> {
        let row = sqlx::query("SELECT * FROM outbox_messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(parse_row).transpose()
    }

    pub async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<OutboxMessage>> {
        let row = sqlx::query("SELECT * FROM outbox_messages WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(parse_row).transpose()
    }

    /// Queued/retrying entries whose next-attempt time has elapsed,
    /// ordered by priority then creation time.
    pub async fn list_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM outbox_messages
             WHERE status IN ('queued', 'retrying') AND next_attempt_at <= ?
             ORDER BY priority DESC, created_at ASC
             LIMIT ?",
        )
        .bind(now.timestamp_millis())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_row).collect()
    }

    /// Claim an entry for sending.
    ///
    /// The transition to `sending` (plus the attempt increment) happens
    /// under the row's own conditional UPDATE: not-due, terminal, and
    /// concurrently-claimed entries all no-op and return `None`.
    pub async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<OutboxMessage>> {
        let result = sqlx::query(
            "UPDATE outbox_messages
             SET status = 'sending', attempts = attempts + 1, updated_at = ?
             WHERE id = ? AND status IN ('queued', 'retrying') AND next_attempt_at <= ?",
        )
        .bind(now_ms())
        .bind(id)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    /// Terminal success; records the resulting Message id.
    pub async fn mark_sent(&self, id: &str, message_id: Option<&str>) -> Result<()> {
        self.transition_from_sending(id, OutboxStatus::Sent, None, None, message_id)
            .await
    }

    /// Transient failure: schedule the next attempt.
    pub async fn mark_retrying(
        &self,
        id: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        self.transition_from_sending(
            id,
            OutboxStatus::Retrying,
            Some(next_attempt_at),
            Some(error),
            None,
        )
        .await
    }

    /// Terminal failure; no further attempts.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        self.transition_from_sending(id, OutboxStatus::Failed, None, Some(error), None)
            .await
    }

    async fn transition_from_sending(
        &self,
        id: &str,
        status: OutboxStatus,
        next_attempt_at: Option<DateTime<Utc>>,
        error: Option<&str>,
        message_id: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox_messages
             SET status = ?,
                 next_attempt_at = COALESCE(?, next_attempt_at),
                 last_error = COALESCE(?, last_error),
                 message_id = COALESCE(?, message_id),
                 updated_at = ?
             WHERE id = ? AND status = 'sending'",
        )
        .bind(status.as_str())
        .bind(next_attempt_at.map(|t| t.timestamp_millis()))
        .bind(error)
        .bind(message_id)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("outbox entry {id} is not in 'sending'");
        }
        Ok(())
    }

    /// Externally cancel a queued/retrying entry.
    ///
    /// Returns false when the entry was already claimed or terminal; an
    /// in-flight send is not cancellable and its outcome still lands.
    pub async fn cancel(&self, id: &str, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbox_messages
             SET status = 'failed', last_error = ?, updated_at = ?
             WHERE id = ? AND status IN ('queued', 'retrying')",
        )
        .bind(reason)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Create the outbox schema if absent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS outbox_messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            channel         TEXT NOT NULL,
            status          TEXT NOT NULL,
            attempts        INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            last_error      TEXT,
            payload         TEXT NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            priority        INTEGER NOT NULL DEFAULT 0,
            message_id      TEXT,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_due
            ON outbox_messages(status, next_attempt_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_order
            ON outbox_messages(priority DESC, created_at ASC);
        "#,
    )
    .execute(pool)
    .await
    .context("failed to run outbox migrations")?;
    Ok(())
}

fn parse_row(row: SqliteRow) -> Result<OutboxMessage> {
    let channel_str: String = row.get("channel");
    let channel = ChannelType::parse(&channel_str)
        .with_context(|| format!("unknown channel in outbox row: {channel_str}"))?;
    let status_str: String = row.get("status");
    let status = OutboxStatus::parse(&status_str)
        .with_context(|| format!("unknown status in outbox row: {status_str}"))?;
    let payload_str: String = row.get("payload");
    let payload: SendRequest =
        serde_json::from_str(&payload_str).context("unreadable outbox payload")?;

    Ok(OutboxMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        channel,
        status,
        attempts: row.get::<i64, _>("attempts") as u32,
        next_attempt_at: from_ms(row.get("next_attempt_at")),
        last_error: row.get("last_error"),
        payload,
        idempotency_key: row.get("idempotency_key"),
        priority: row.get("priority"),
        message_id: row.get("message_id"),
        created_at: from_ms(row.get("created_at")),
        updated_at: from_ms(row.get("updated_at")),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::Duration;

    use super::*;

    async fn store() -> OutboxStore {
        OutboxStore::new("sqlite::memory:").await.unwrap()
    }

    fn request(conversation: &str) -> SendRequest {
        SendRequest {
            conversation_id: conversation.into(),
            channel: ChannelType::Whatsapp,
            target_id: None,
            body: "your technician arrives at 14:00".into(),
            subject: None,
            attachments: vec![],
            variables: Default::default(),
        }
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let store = store().await;
        let first = store.enqueue(&request("c-1"), "key-1", 0).await.unwrap();
        assert!(first.created);

        let second = store.enqueue(&request("c-1"), "key-1", 0).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.entry.id, first.entry.id);

        let due = store.list_due(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn enqueue_returns_sent_entry_without_resending() {
        let store = store().await;
        let first = store.enqueue(&request("c-1"), "key-1", 0).await.unwrap();
        let claimed = store.claim(&first.entry.id, Utc::now()).await.unwrap();
        assert!(claimed.is_some());
        store
            .mark_sent(&first.entry.id, Some("msg-1"))
            .await
            .unwrap();

        let replay = store.enqueue(&request("c-1"), "key-1", 0).await.unwrap();
        assert!(!replay.created);
        assert_eq!(replay.entry.status, OutboxStatus::Sent);
        assert_eq!(replay.entry.message_id.as_deref(), Some("msg-1"));
    }

    #[tokio::test]
    async fn empty_idempotency_key_is_rejected() {
        let store = store().await;
        assert!(store.enqueue(&request("c-1"), "  ", 0).await.is_err());
    }

    #[tokio::test]
    async fn claim_increments_attempts_and_excludes_others() {
        let store = store().await;
        let e = store
            .enqueue(&request("c-1"), "key-1", 0)
            .await
            .unwrap()
            .entry;

        let claimed = store.claim(&e.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.status, OutboxStatus::Sending);
        assert_eq!(claimed.attempts, 1);

        // A second worker loses the claim race.
        assert!(store.claim(&e.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn not_due_entries_are_not_claimable() {
        let store = store().await;
        let e = store
            .enqueue(&request("c-1"), "key-1", 0)
            .await
            .unwrap()
            .entry;
        let claimed = store.claim(&e.id, Utc::now()).await.unwrap().unwrap();
        let future = Utc::now() + Duration::minutes(5);
        store
            .mark_retrying(&e.id, future, "rate limited")
            .await
            .unwrap();
        drop(claimed);

        // Not due yet.
        assert!(store.claim(&e.id, Utc::now()).await.unwrap().is_none());
        assert!(store.list_due(Utc::now(), 10).await.unwrap().is_empty());

        // Due once the backoff elapses.
        let later = future + Duration::seconds(1);
        assert!(store.claim(&e.id, later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn terminal_entries_are_never_reclaimed() {
        let store = store().await;
        let e = store
            .enqueue(&request("c-1"), "key-1", 0)
            .await
            .unwrap()
            .entry;
        store.claim(&e.id, Utc::now()).await.unwrap();
        store.mark_failed(&e.id, "invalid recipient").await.unwrap();

        assert!(store.claim(&e.id, Utc::now()).await.unwrap().is_none());
        let reloaded = store.get(&e.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, OutboxStatus::Failed);
        assert_eq!(reloaded.last_error.as_deref(), Some("invalid recipient"));
    }

    #[tokio::test]
    async fn due_listing_orders_by_priority_then_age() {
        let store = store().await;
        let low_old = store
            .enqueue(&request("c-1"), "key-low-old", 0)
            .await
            .unwrap()
            .entry;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let high = store
            .enqueue(&request("c-2"), "key-high", 5)
            .await
            .unwrap()
            .entry;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let low_new = store
            .enqueue(&request("c-3"), "key-low-new", 0)
            .await
            .unwrap()
            .entry;

        let due = store.list_due(Utc::now(), 10).await.unwrap();
        let ids: Vec<_> = due.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![high.id.as_str(), low_old.id.as_str(), low_new.id.as_str()]);
    }

    #[tokio::test]
    async fn cancel_applies_only_before_claim() {
        let store = store().await;
        let e = store
            .enqueue(&request("c-1"), "key-1", 0)
            .await
            .unwrap()
            .entry;

        assert!(store.cancel(&e.id, "operator cancelled").await.unwrap());
        let reloaded = store.get(&e.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, OutboxStatus::Failed);

        // Already terminal: cancelling again is a no-op.
        assert!(!store.cancel(&e.id, "again").await.unwrap());

        // An in-flight entry cannot be cancelled.
        let f = store
            .enqueue(&request("c-2"), "key-2", 0)
            .await
            .unwrap()
            .entry;
        store.claim(&f.id, Utc::now()).await.unwrap();
        assert!(!store.cancel(&f.id, "too late").await.unwrap());
    }
}
