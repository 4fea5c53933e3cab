//! SQLite pool bootstrap and schema migrations.

use {
    anyhow::{Context, Result},
    sqlx::{SqlitePool, sqlite::SqlitePoolOptions},
};

/// Connect a pool and run migrations.
///
/// Use `sqlite::memory:` for tests. For shared pools, call
/// [`run_migrations`] once and hand the pool to each repository.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to SQLite")?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Create the conversation-store schema if absent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            contact_id      TEXT NOT NULL,
            channel         TEXT NOT NULL,
            status          TEXT NOT NULL,
            subject         TEXT,
            last_message_at INTEGER,
            metadata        TEXT NOT NULL DEFAULT '{}',
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_contact_channel
            ON conversations(contact_id, channel, status);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            channel         TEXT NOT NULL,
            direction       TEXT NOT NULL,
            status          TEXT NOT NULL,
            external_id     TEXT,
            subject         TEXT,
            body            TEXT NOT NULL,
            sender          TEXT,
            target_id       TEXT,
            sent_at         INTEGER,
            received_at     INTEGER,
            metadata        TEXT NOT NULL DEFAULT '{}',
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_external
            ON messages(channel, external_id);
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, received_at);
        CREATE INDEX IF NOT EXISTS idx_messages_fingerprint
            ON messages(channel, sender, received_at);

        CREATE TABLE IF NOT EXISTS contact_channels (
            id         TEXT PRIMARY KEY,
            contact_id TEXT NOT NULL,
            channel    TEXT NOT NULL,
            address    TEXT NOT NULL,
            is_primary INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE(channel, address)
        );

        CREATE TABLE IF NOT EXISTS dead_letters (
            id         TEXT PRIMARY KEY,
            channel    TEXT NOT NULL,
            payload    TEXT NOT NULL,
            error      TEXT NOT NULL,
            attempts   INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("failed to run conversation-store migrations")?;

    Ok(())
}
