//! Durable mailbox cursors.
//!
//! The cursor is persisted with the mailbox's configuration record and
//! only advances after a batch is durably processed, so a crash mid-batch
//! re-processes (idempotently, via dedup) instead of skipping mail.

use std::collections::HashMap;

use {
    anyhow::{Context, Result},
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    sqlx::{Row, SqlitePool},
    tokio::sync::Mutex,
};

use switchboard_common::time::now_ms;

/// Protocol-specific poll position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum MailboxCursor {
    /// IMAP UIDs are strictly increasing within a mailbox.
    Imap { last_uid: u32 },
    /// POP3 UIDLs carry no ordering guarantee, so a bounded history of
    /// recently-seen values stands in for a high-water mark.
    Pop3 { recent_uidls: Vec<String> },
}

/// Persistence for mailbox cursors, keyed by channel-target id.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, target_id: &str) -> Result<Option<MailboxCursor>>;
    async fn save(&self, target_id: &str, cursor: &MailboxCursor) -> Result<()>;
}

/// SQLite-backed cursor store sharing the engine pool.
pub struct SqliteCursorStore {
    pool: SqlitePool,
}

impl SqliteCursorStore {
    /// Create the store and its schema.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS mailbox_cursors (
                target_id  TEXT PRIMARY KEY,
                cursor     TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to run mailbox-cursor migrations")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn load(&self, target_id: &str) -> Result<Option<MailboxCursor>> {
        let row = sqlx::query("SELECT cursor FROM mailbox_cursors WHERE target_id = ?")
            .bind(target_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let raw: String = r.get("cursor");
            serde_json::from_str(&raw).context("unreadable mailbox cursor")
        })
        .transpose()
    }

    async fn save(&self, target_id: &str, cursor: &MailboxCursor) -> Result<()> {
        let encoded = serde_json::to_string(cursor)?;
        sqlx::query(
            "INSERT INTO mailbox_cursors (target_id, cursor, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(target_id) DO UPDATE SET
                 cursor = excluded.cursor,
                 updated_at = excluded.updated_at",
        )
        .bind(target_id)
        .bind(&encoded)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory cursor store for tests and embedding.
#[derive(Default)]
pub struct InMemoryCursorStore {
    cursors: Mutex<HashMap<String, MailboxCursor>>,
}

impl InMemoryCursorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn load(&self, target_id: &str) -> Result<Option<MailboxCursor>> {
        Ok(self.cursors.lock().await.get(target_id).cloned())
    }

    async fn save(&self, target_id: &str, cursor: &MailboxCursor) -> Result<()> {
        self.cursors
            .lock()
            .await
            .insert(target_id.to_string(), cursor.clone());
        Ok(())
    }
}
