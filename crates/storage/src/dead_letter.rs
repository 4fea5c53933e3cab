//! Dead-letter repository: inbound payloads that exhausted their retries,
//! kept for manual inspection and replay.

use {
    anyhow::{Context, Result},
    sqlx::{Row, SqlitePool, sqlite::SqliteRow},
};

use {
    switchboard_channels::ChannelType,
    switchboard_common::time::{from_ms, now_ms},
};

use crate::models::DeadLetter;

/// Repository over the `dead_letters` table.
#[derive(Clone)]
pub struct DeadLetterRepo {
    pool: SqlitePool,
}

impl DeadLetterRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        channel: ChannelType,
        payload: &serde_json::Value,
        error: &str,
        attempts: u32,
    ) -> Result<DeadLetter> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO dead_letters (id, channel, payload, error, attempts, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(channel.as_str())
        .bind(payload.to_string())
        .bind(error)
        .bind(i64::from(attempts))
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .context("failed to insert dead letter")?;

        self.get(&id).await?.context("dead letter vanished after insert")
    }

    pub async fn get(&self, id: &str) -> Result<Option<DeadLetter>> {
        let row = sqlx::query("SELECT * FROM dead_letters WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(parse_row).transpose()
    }

    /// Oldest first, for operator triage.
    pub async fn list(&self, limit: u32) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT * FROM dead_letters ORDER BY created_at ASC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_row).collect()
    }

    /// Remove a dead letter after a successful manual replay.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("dead letter not found: {id}");
        }
        Ok(())
    }
}

fn parse_row(row: SqliteRow) -> Result<DeadLetter> {
    let channel_str: String = row.get("channel");
    let channel = ChannelType::parse(&channel_str)
        .with_context(|| format!("unknown channel in dead_letters row: {channel_str}"))?;
    let payload_str: String = row.get("payload");
    let payload = serde_json::from_str(&payload_str)
        .with_context(|| "unreadable dead letter payload")?;

    Ok(DeadLetter {
        id: row.get("id"),
        channel,
        payload,
        error: row.get("error"),
        attempts: row.get::<i64, _>("attempts") as u32,
        created_at: from_ms(row.get("created_at")),
    })
}
