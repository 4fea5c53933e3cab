//! Channel taxonomy and the canonical message value objects every other
//! crate speaks in.

use std::collections::BTreeMap;

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

/// A distinct messaging transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Email,
    Whatsapp,
    FacebookMessenger,
    InstagramDm,
    ChatWidget,
}

impl ChannelType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Whatsapp => "whatsapp",
            Self::FacebookMessenger => "facebook_messenger",
            Self::InstagramDm => "instagram_dm",
            Self::ChatWidget => "chat_widget",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Self::Email),
            "whatsapp" => Some(Self::Whatsapp),
            "facebook_messenger" => Some(Self::FacebookMessenger),
            "instagram_dm" => Some(Self::InstagramDm),
            "chat_widget" => Some(Self::ChatWidget),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message direction relative to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
    Internal,
}

impl Direction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Internal => "internal",
        }
    }
}

/// Lifecycle status of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    Queued,
    Sent,
    Failed,
}

impl MessageStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// Conversation thread status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Pending,
    Resolved,
    Snoozed,
}

impl ConversationStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Snoozed => "snoozed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "pending" => Some(Self::Pending),
            "resolved" => Some(Self::Resolved),
            "snoozed" => Some(Self::Snoozed),
            _ => None,
        }
    }
}

/// Free-form metadata map carried on conversations, messages, and payloads.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// A raw inbound payload as delivered by a provider, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawInbound {
    pub channel: ChannelType,
    /// Channel-target that observed the payload, when known at intake
    /// (webhook routing); the pipeline resolves it otherwise.
    pub target_id: Option<String>,
    pub sender: String,
    pub external_id: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A canonical inbound event produced by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub channel: ChannelType,
    pub target_id: String,
    /// Sender address normalized per channel rules.
    pub sender: String,
    /// Normalized provider id, if the provider supplied one.
    pub external_id: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub metadata: Metadata,
}

/// A reference to a stored attachment blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// A request to send one outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub conversation_id: String,
    pub channel: ChannelType,
    /// Explicit channel-target; the dispatcher resolves the default (or
    /// the reply-bound target) when absent.
    pub target_id: Option<String>,
    pub body: String,
    pub subject: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    /// `{{key}}` personalization variables substituted into body/subject.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// A fully-rendered payload handed to a channel sender.
#[derive(Debug, Clone)]
pub struct OutboundPayload {
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
    pub attachments: Vec<AttachmentRef>,
    /// External id of the inbound message being replied to, for channels
    /// that thread replies (email `In-Reply-To`).
    pub in_reply_to: Option<String>,
}

/// Outcome of one provider send attempt.
///
/// Explicit result instead of error propagation: the outbox worker
/// branches on the variant to decide between retry and terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    /// Provider accepted the message.
    Sent { provider_id: Option<String> },
    /// Worth retrying: timeout, 5xx, rate limit.
    Transient { error: String },
    /// Will not succeed on retry: validation, auth, business-rule
    /// rejection, non-429 4xx.
    Permanent { error: String },
}

impl SendOutcome {
    #[must_use]
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }

    /// Error text for the failed variants.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Sent { .. } => None,
            Self::Transient { error } | Self::Permanent { error } => Some(error),
        }
    }
}

/// Normalize a contact address per channel rules.
///
/// Email addresses case-fold; phone-backed channels keep digits only (a
/// leading `+` is dropped); page-scoped ids pass through trimmed.
#[must_use]
pub fn normalize_address(channel: ChannelType, address: &str) -> String {
    let trimmed = address.trim();
    match channel {
        ChannelType::Email => trimmed.to_lowercase(),
        ChannelType::Whatsapp => trimmed.chars().filter(char::is_ascii_digit).collect(),
        ChannelType::FacebookMessenger | ChannelType::InstagramDm | ChannelType::ChatWidget => {
            trimmed.to_string()
        },
    }
}
