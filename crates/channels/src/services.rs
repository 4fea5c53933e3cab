//! Collaborator interfaces the engine consumes as black boxes.
//!
//! Each trait has a `Noop` implementation so the engine can be exercised
//! standalone before the surrounding platform wires real services in.

use {async_trait::async_trait, serde::Serialize, tracing::warn};

use switchboard_common::Result;

use crate::types::{AttachmentRef, ChannelType, RawInbound};

/// Entry point pollers and webhook handlers feed raw payloads into.
///
/// The inbound pipeline implements this; duplicates and self-sends are
/// no-op successes behind it, so callers can replay freely.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn dispatch_inbound(&self, raw: RawInbound) -> Result<()>;
}

/// A resolved contact, as owned by the external identity subsystem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactRef {
    pub id: String,
    pub display_name: Option<String>,
}

/// Contact/person resolution: resolve-or-create by channel + address.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn resolve_or_create(&self, channel: ChannelType, address: &str) -> Result<ContactRef>;
}

/// Attachment blob storage: store bytes, get back a reference.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn store(
        &self,
        filename: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<AttachmentRef>;
}

/// Events published to the live fan-out transport. Fire-and-forget: the
/// engine never depends on delivery.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationEvent {
    MessageReceived {
        conversation_id: String,
        message_id: String,
        channel: ChannelType,
    },
    MessageSent {
        conversation_id: String,
        message_id: String,
        channel: ChannelType,
    },
    MessageFailed {
        conversation_id: String,
        message_id: String,
        channel: ChannelType,
        error: String,
    },
    ConversationReopened {
        conversation_id: String,
    },
}

/// Fire-and-forget notification sink.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: ConversationEvent);
}

/// Rejects every contact lookup; use only where ingest is not exercised.
pub struct NoopContactDirectory;

#[async_trait]
impl ContactDirectory for NoopContactDirectory {
    async fn resolve_or_create(&self, channel: ChannelType, address: &str) -> Result<ContactRef> {
        warn!(%channel, address, "contact directory not configured");
        Err(switchboard_common::Error::configuration(
            "contact directory not configured",
        ))
    }
}

/// Drops attachment bytes and returns an inert reference.
pub struct NoopAttachmentStore;

#[async_trait]
impl AttachmentStore for NoopAttachmentStore {
    async fn store(
        &self,
        filename: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<AttachmentRef> {
        Ok(AttachmentRef {
            id: format!("noop-{filename}"),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            size_bytes: bytes.len() as u64,
        })
    }
}

/// Swallows events.
pub struct NoopNotificationSink;

#[async_trait]
impl NotificationSink for NoopNotificationSink {
    async fn publish(&self, _event: ConversationEvent) {}
}
