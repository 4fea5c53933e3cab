//! Conversation repository.

use {
    anyhow::{Context, Result},
    sqlx::{Row, SqlitePool, sqlite::SqliteRow},
    tracing::warn,
};

use {
    switchboard_channels::{ChannelType, ConversationStatus, Metadata},
    switchboard_common::time::{from_ms, now_ms},
};

use crate::models::Conversation;

/// Repository over the `conversations` table.
#[derive(Clone)]
pub struct ConversationRepo {
    pool: SqlitePool,
}

/// Input for creating a conversation.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub contact_id: String,
    pub channel: ChannelType,
    pub subject: Option<String>,
    pub metadata: Metadata,
}

impl ConversationRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, new: NewConversation) -> Result<Conversation> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let metadata = serde_json::to_string(&new.metadata)?;

        sqlx::query(
            "INSERT INTO conversations
                (id, contact_id, channel, status, subject, metadata, created_at, updated_at)
             VALUES (?, ?, ?, 'open', ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.contact_id)
        .bind(new.channel.as_str())
        .bind(&new.subject)
        .bind(&metadata)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to insert conversation")?;

        self.get(&id)
            .await?
            .context("conversation vanished after insert")
    }

    pub async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(parse_row).transpose()
    }

    /// The canonically-open conversation for a contact+channel pair.
    ///
    /// At most one conversation is treated as open per pair; the newest
    /// wins if older rows were left behind.
    pub async fn find_open(
        &self,
        contact_id: &str,
        channel: ChannelType,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT * FROM conversations
             WHERE contact_id = ? AND channel = ? AND status = 'open'
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(contact_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_row).transpose()
    }

    /// Exact-or-prefix match on a conversation id fragment embedded in an
    /// email subject or address tag.
    pub async fn find_by_id_prefix(&self, fragment: &str) -> Result<Option<Conversation>> {
        if fragment.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(
            "SELECT * FROM conversations WHERE id LIKE ? || '%'
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(fragment)
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_row).transpose()
    }

    /// Match a numeric ticket token against conversation subjects
    /// (`... #4821 ...`).
    pub async fn find_by_subject_token(&self, token: &str) -> Result<Option<Conversation>> {
        if token.is_empty() || !token.chars().all(|c| c.is_ascii_digit()) {
            return Ok(None);
        }
        let row = sqlx::query(
            "SELECT * FROM conversations WHERE subject LIKE '%#' || ? || '%'
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_row).transpose()
    }

    pub async fn set_status(&self, id: &str, status: ConversationStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE conversations SET status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("conversation not found: {id}");
        }
        Ok(())
    }

    /// Stamp the last-message timestamp, monotonically.
    pub async fn touch_last_message(&self, id: &str, at_ms: i64) -> Result<()> {
        sqlx::query(
            "UPDATE conversations
             SET last_message_at = MAX(COALESCE(last_message_at, 0), ?), updated_at = ?
             WHERE id = ?",
        )
        .bind(at_ms)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Merge keys into the conversation's metadata map.
    ///
    /// Used for thread-continuity hints and non-fatal warnings such as
    /// "possibly unrelated reply".
    pub async fn merge_metadata(&self, id: &str, patch: &Metadata) -> Result<()> {
        let Some(conversation) = self.get(id).await? else {
            anyhow::bail!("conversation not found: {id}");
        };
        let mut metadata = conversation.metadata;
        for (key, value) in patch {
            metadata.insert(key.clone(), value.clone());
        }
        let encoded = serde_json::to_string(&metadata)?;

        sqlx::query("UPDATE conversations SET metadata = ?, updated_at = ? WHERE id = ?")
            .bind(&encoded)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_row(row: SqliteRow) -> Result<Conversation> {
    let channel_str: String = row.get("channel");
    let channel = ChannelType::parse(&channel_str)
        .with_context(|| format!("unknown channel in conversations row: {channel_str}"))?;
    let status_str: String = row.get("status");
    let status = ConversationStatus::parse(&status_str)
        .with_context(|| format!("unknown status in conversations row: {status_str}"))?;
    let metadata_str: String = row.get("metadata");
    let metadata: Metadata = serde_json::from_str(&metadata_str).unwrap_or_else(|e| {
        warn!(error = %e, "unreadable conversation metadata, treating as empty");
        Metadata::new()
    });

    Ok(Conversation {
        id: row.get("id"),
        contact_id: row.get("contact_id"),
        channel,
        status,
        subject: row.get("subject"),
        last_message_at: row
            .get::<Option<i64>, _>("last_message_at")
            .map(from_ms),
        metadata,
        created_at: from_ms(row.get("created_at")),
        updated_at: from_ms(row.get("updated_at")),
    })
}
