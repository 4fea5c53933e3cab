//! Contact channel-address repository.

use {
    anyhow::{Context, Result},
    sqlx::{Row, SqlitePool, sqlite::SqliteRow},
};

use {
    switchboard_channels::{ChannelType, normalize_address},
    switchboard_common::time::{from_ms, now_ms},
};

use crate::models::ContactChannel;

/// Repository over the `contact_channels` table.
#[derive(Clone)]
pub struct ContactChannelRepo {
    pool: SqlitePool,
}

impl ContactChannelRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert-or-fetch a contact's address on a channel. The address is
    /// normalized before storage so lookups converge on one row.
    pub async fn upsert(
        &self,
        contact_id: &str,
        channel: ChannelType,
        address: &str,
        is_primary: bool,
    ) -> Result<ContactChannel> {
        let normalized = normalize_address(channel, address);
        if normalized.is_empty() {
            anyhow::bail!("empty address for channel {channel}");
        }

        if is_primary {
            // Demote any other primary for this contact + channel type.
            sqlx::query(
                "UPDATE contact_channels SET is_primary = 0
                 WHERE contact_id = ? AND channel = ?",
            )
            .bind(contact_id)
            .bind(channel.as_str())
            .execute(&self.pool)
            .await?;
        }

        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO contact_channels (id, contact_id, channel, address, is_primary, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(channel, address) DO UPDATE SET
                 is_primary = excluded.is_primary",
        )
        .bind(&id)
        .bind(contact_id)
        .bind(channel.as_str())
        .bind(&normalized)
        .bind(is_primary)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .context("failed to upsert contact channel")?;

        self.find_by_address(channel, &normalized)
            .await?
            .context("contact channel vanished after upsert")
    }

    pub async fn find_by_address(
        &self,
        channel: ChannelType,
        address: &str,
    ) -> Result<Option<ContactChannel>> {
        let normalized = normalize_address(channel, address);
        let row = sqlx::query(
            "SELECT * FROM contact_channels WHERE channel = ? AND address = ?",
        )
        .bind(channel.as_str())
        .bind(&normalized)
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_row).transpose()
    }

    pub async fn list_for_contact(&self, contact_id: &str) -> Result<Vec<ContactChannel>> {
        let rows = sqlx::query(
            "SELECT * FROM contact_channels WHERE contact_id = ? ORDER BY created_at ASC",
        )
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_row).collect()
    }
}

fn parse_row(row: SqliteRow) -> Result<ContactChannel> {
    let channel_str: String = row.get("channel");
    let channel = ChannelType::parse(&channel_str)
        .with_context(|| format!("unknown channel in contact_channels row: {channel_str}"))?;

    Ok(ContactChannel {
        id: row.get("id"),
        contact_id: row.get("contact_id"),
        channel,
        address: row.get("address"),
        is_primary: row.get::<i64, _>("is_primary") != 0,
        created_at: from_ms(row.get("created_at")),
    })
}
