//! Fully-populated value objects returned by the repositories.
//!
//! Repositories return these directly; nothing here lazy-loads related
//! entities.

use {
    chrono::{DateTime, Utc},
    serde::Serialize,
};

use switchboard_channels::{ChannelType, ConversationStatus, Direction, MessageStatus, Metadata};

/// An ongoing thread with one contact on one channel.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub contact_id: String,
    pub channel: ChannelType,
    pub status: ConversationStatus,
    pub subject: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable-once-sent unit within a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub channel: ChannelType,
    pub direction: Direction,
    pub status: MessageStatus,
    pub external_id: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    /// Normalized counterparty address; `None` on internal notes.
    pub sender: Option<String>,
    /// Channel-target that delivered or received this message.
    pub target_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// Input for inserting a message row.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub channel: ChannelType,
    pub direction: Direction,
    pub status: MessageStatus,
    pub external_id: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub sender: Option<String>,
    pub target_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

/// A contact's address on one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ContactChannel {
    pub id: String,
    pub contact_id: String,
    pub channel: ChannelType,
    /// Normalized per channel rules: case-folded email, digit-only phone.
    pub address: String,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

/// An inbound payload that exhausted its pipeline retries, preserved for
/// manual replay.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: String,
    pub channel: ChannelType,
    pub payload: serde_json::Value,
    pub error: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}
