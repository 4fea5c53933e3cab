//! Message repository.

use {
    anyhow::{Context, Result},
    chrono::{DateTime, Duration, Utc},
    sqlx::{Row, SqlitePool, sqlite::SqliteRow},
    tracing::warn,
};

use {
    switchboard_channels::{ChannelType, Direction, MessageStatus, Metadata},
    switchboard_common::time::{from_ms, now_ms},
};

use crate::models::{Message, NewMessage};

/// Repository over the `messages` table.
#[derive(Clone)]
pub struct MessageRepo {
    pool: SqlitePool,
}

impl MessageRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, new: NewMessage) -> Result<Message> {
        let id = uuid::Uuid::new_v4().to_string();
        let metadata = serde_json::to_string(&new.metadata)?;

        sqlx::query(
            "INSERT INTO messages
                (id, conversation_id, channel, direction, status, external_id, subject,
                 body, sender, target_id, sent_at, received_at, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.conversation_id)
        .bind(new.channel.as_str())
        .bind(new.direction.as_str())
        .bind(new.status.as_str())
        .bind(&new.external_id)
        .bind(&new.subject)
        .bind(&new.body)
        .bind(&new.sender)
        .bind(&new.target_id)
        .bind(new.sent_at.map(|t| t.timestamp_millis()))
        .bind(new.received_at.map(|t| t.timestamp_millis()))
        .bind(&metadata)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .context("failed to insert message")?;

        self.get(&id).await?.context("message vanished after insert")
    }

    pub async fn get(&self, id: &str) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(parse_row).transpose()
    }

    /// Inbound dedup lookup by provider id.
    ///
    /// `target_id = None` searches across every target of the channel
    /// (email, where polling and SMTP receipt can see the same message);
    /// `Some` scopes the match to one target.
    pub async fn find_inbound_by_external_id(
        &self,
        channel: ChannelType,
        external_id: &str,
        target_id: Option<&str>,
    ) -> Result<Option<Message>> {
        let row = match target_id {
            Some(target) => {
                sqlx::query(
                    "SELECT * FROM messages
                     WHERE channel = ? AND external_id = ? AND direction = 'inbound'
                       AND target_id = ?
                     LIMIT 1",
                )
                .bind(channel.as_str())
                .bind(external_id)
                .bind(target)
                .fetch_optional(&self.pool)
                .await?
            },
            None => {
                sqlx::query(
                    "SELECT * FROM messages
                     WHERE channel = ? AND external_id = ? AND direction = 'inbound'
                     LIMIT 1",
                )
                .bind(channel.as_str())
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await?
            },
        };
        row.map(parse_row).transpose()
    }

    /// Lookup by external id regardless of direction, for email threading
    /// headers (`In-Reply-To` can reference our own outbound send).
    pub async fn find_by_external_id(
        &self,
        channel: ChannelType,
        external_id: &str,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT * FROM messages WHERE channel = ? AND external_id = ? LIMIT 1",
        )
        .bind(channel.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_row).transpose()
    }

    /// Fingerprint dedup for id-less payloads: same channel, sender,
    /// subject and body, received within ±`window` of `center`.
    pub async fn find_inbound_fingerprint(
        &self,
        channel: ChannelType,
        sender: &str,
        subject: Option<&str>,
        body: &str,
        center: DateTime<Utc>,
        window: Duration,
    ) -> Result<Option<Message>> {
        let low = (center - window).timestamp_millis();
        let high = (center + window).timestamp_millis();

        let row = sqlx::query(
            "SELECT * FROM messages
             WHERE channel = ? AND direction = 'inbound' AND sender = ?
               AND COALESCE(subject, '') = COALESCE(?, '')
               AND body = ?
               AND received_at BETWEEN ? AND ?
             LIMIT 1",
        )
        .bind(channel.as_str())
        .bind(sender)
        .bind(subject)
        .bind(body)
        .bind(low)
        .bind(high)
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_row).transpose()
    }

    /// Most recent inbound message of a conversation, by receive
    /// timestamp. Drives reply-channel binding and reply-window checks.
    pub async fn last_inbound(&self, conversation_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT * FROM messages
             WHERE conversation_id = ? AND direction = 'inbound'
             ORDER BY received_at DESC
             LIMIT 1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_row).transpose()
    }

    /// Messages of one conversation in visibility order: timestamp, not
    /// insertion order, because polling and sends are concurrent.
    pub async fn list_for_conversation(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE conversation_id = ?
             ORDER BY COALESCE(received_at, sent_at, created_at) ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_row).collect()
    }

    /// Terminal success: record provider id and send timestamp.
    pub async fn mark_sent(
        &self,
        id: &str,
        provider_id: Option<&str>,
        sent_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE messages
             SET status = 'sent', external_id = COALESCE(?, external_id), sent_at = ?
             WHERE id = ?",
        )
        .bind(provider_id)
        .bind(sent_at.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("message not found: {id}");
        }
        Ok(())
    }

    /// Terminal failure: store the error summary in metadata so an agent
    /// can see and retry.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let Some(message) = self.get(id).await? else {
            anyhow::bail!("message not found: {id}");
        };
        let mut metadata = message.metadata;
        metadata.insert("error".into(), serde_json::Value::String(error.into()));
        let encoded = serde_json::to_string(&metadata)?;

        sqlx::query("UPDATE messages SET status = 'failed', metadata = ? WHERE id = ?")
            .bind(&encoded)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_row(row: SqliteRow) -> Result<Message> {
    let channel_str: String = row.get("channel");
    let channel = ChannelType::parse(&channel_str)
        .with_context(|| format!("unknown channel in messages row: {channel_str}"))?;
    let direction = match row.get::<String, _>("direction").as_str() {
        "inbound" => Direction::Inbound,
        "outbound" => Direction::Outbound,
        "internal" => Direction::Internal,
        other => anyhow::bail!("unknown direction in messages row: {other}"),
    };
    let status = match row.get::<String, _>("status").as_str() {
        "received" => MessageStatus::Received,
        "queued" => MessageStatus::Queued,
        "sent" => MessageStatus::Sent,
        "failed" => MessageStatus::Failed,
        other => anyhow::bail!("unknown status in messages row: {other}"),
    };
    let metadata_str: String = row.get("metadata");
    let metadata: Metadata = serde_json::from_str(&metadata_str).unwrap_or_else(|e| {
        warn!(error = %e, "unreadable message metadata, treating as empty");
        Metadata::new()
    });

    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        channel,
        direction,
        status,
        external_id: row.get("external_id"),
        subject: row.get("subject"),
        body: row.get("body"),
        sender: row.get("sender"),
        target_id: row.get("target_id"),
        sent_at: row.get::<Option<i64>, _>("sent_at").map(from_ms),
        received_at: row.get::<Option<i64>, _>("received_at").map(from_ms),
        metadata,
        created_at: from_ms(row.get("created_at")),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        conversations::{ConversationRepo, NewConversation},
        database::connect,
    };

    async fn fixtures() -> (MessageRepo, String) {
        let pool = connect("sqlite::memory:").await.unwrap();
        let conversations = ConversationRepo::new(pool.clone());
        let conversation = conversations
            .insert(NewConversation {
                contact_id: "contact-1".into(),
                channel: ChannelType::Email,
                subject: None,
                metadata: Metadata::new(),
            })
            .await
            .unwrap();
        (MessageRepo::new(pool), conversation.id)
    }

    fn inbound(conversation_id: &str, external_id: Option<&str>, at_ms: i64) -> NewMessage {
        NewMessage {
            conversation_id: conversation_id.into(),
            channel: ChannelType::Email,
            direction: Direction::Inbound,
            status: MessageStatus::Received,
            external_id: external_id.map(String::from),
            subject: Some("signal drop".into()),
            body: "router reboots nightly".into(),
            sender: Some("kim@example.com".into()),
            target_id: Some("mailbox-1".into()),
            sent_at: None,
            received_at: Some(from_ms(at_ms)),
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn external_id_lookup_scopes_by_target() {
        let (repo, conversation_id) = fixtures().await;
        repo.insert(inbound(&conversation_id, Some("msg-1"), 1_000))
            .await
            .unwrap();

        let cross = repo
            .find_inbound_by_external_id(ChannelType::Email, "msg-1", None)
            .await
            .unwrap();
        assert!(cross.is_some());

        let same_target = repo
            .find_inbound_by_external_id(ChannelType::Email, "msg-1", Some("mailbox-1"))
            .await
            .unwrap();
        assert!(same_target.is_some());

        let other_target = repo
            .find_inbound_by_external_id(ChannelType::Email, "msg-1", Some("mailbox-2"))
            .await
            .unwrap();
        assert!(other_target.is_none());
    }

    #[tokio::test]
    async fn fingerprint_matches_within_window_only() {
        let (repo, conversation_id) = fixtures().await;
        let center = from_ms(600_000);
        repo.insert(inbound(&conversation_id, None, 600_000))
            .await
            .unwrap();

        let hit = repo
            .find_inbound_fingerprint(
                ChannelType::Email,
                "kim@example.com",
                Some("signal drop"),
                "router reboots nightly",
                center + Duration::seconds(90),
                Duration::seconds(300),
            )
            .await
            .unwrap();
        assert!(hit.is_some());

        let outside = repo
            .find_inbound_fingerprint(
                ChannelType::Email,
                "kim@example.com",
                Some("signal drop"),
                "router reboots nightly",
                center + Duration::seconds(301),
                Duration::seconds(300),
            )
            .await
            .unwrap();
        assert!(outside.is_none());

        let other_body = repo
            .find_inbound_fingerprint(
                ChannelType::Email,
                "kim@example.com",
                Some("signal drop"),
                "different text",
                center,
                Duration::seconds(300),
            )
            .await
            .unwrap();
        assert!(other_body.is_none());
    }

    #[tokio::test]
    async fn last_inbound_follows_receive_timestamp() {
        let (repo, conversation_id) = fixtures().await;
        // Inserted out of order: the later timestamp wins.
        let late = repo
            .insert(inbound(&conversation_id, Some("late"), 9_000))
            .await
            .unwrap();
        repo.insert(inbound(&conversation_id, Some("early"), 3_000))
            .await
            .unwrap();

        let last = repo.last_inbound(&conversation_id).await.unwrap().unwrap();
        assert_eq!(last.id, late.id);
    }

    #[tokio::test]
    async fn mark_sent_records_provider_id() {
        let (repo, conversation_id) = fixtures().await;
        let message = repo
            .insert(NewMessage {
                direction: Direction::Outbound,
                status: MessageStatus::Queued,
                external_id: None,
                received_at: None,
                ..inbound(&conversation_id, None, 0)
            })
            .await
            .unwrap();

        repo.mark_sent(&message.id, Some("prov-9"), from_ms(5_000))
            .await
            .unwrap();

        let reloaded = repo.get(&message.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, MessageStatus::Sent);
        assert_eq!(reloaded.external_id.as_deref(), Some("prov-9"));
        assert_eq!(reloaded.sent_at.map(|t| t.timestamp_millis()), Some(5_000));
    }

    #[tokio::test]
    async fn mark_failed_stores_error_summary() {
        let (repo, conversation_id) = fixtures().await;
        let message = repo
            .insert(inbound(&conversation_id, None, 0))
            .await
            .unwrap();

        repo.mark_failed(&message.id, "smtp: connection refused")
            .await
            .unwrap();

        let reloaded = repo.get(&message.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, MessageStatus::Failed);
        assert_eq!(
            reloaded.metadata.get("error"),
            Some(&serde_json::json!("smtp: connection refused"))
        );
    }
}
