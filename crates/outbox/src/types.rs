//! Outbox entry model and status machine.

use {
    chrono::{DateTime, Utc},
    serde::Serialize,
};

use switchboard_channels::{ChannelType, SendRequest};

/// Status machine: `queued → sending → {sent | retrying | failed}`, with
/// `retrying → sending` repeatable until the attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Queued,
    Sending,
    Retrying,
    Sent,
    Failed,
}

impl OutboxStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Retrying => "retrying",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "sending" => Some(Self::Sending),
            "retrying" => Some(Self::Retrying),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal entries are never claimed again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

/// A durable, queued representation of one pending send.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxMessage {
    pub id: String,
    pub conversation_id: String,
    pub channel: ChannelType,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// The serialized send request replayed on every attempt.
    pub payload: SendRequest,
    /// Caller-supplied key making enqueue idempotent.
    pub idempotency_key: String,
    pub priority: i64,
    /// Id of the resulting persisted Message, set on success.
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
