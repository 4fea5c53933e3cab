//! Channel plumbing shared by the routing engine.
//!
//! Each channel (email, WhatsApp, Messenger, Instagram DM) implements the
//! [`ChannelAdapter`] trait with `normalize`, `is_self_sent`, and `send`;
//! the normalizer and dispatcher hold an [`AdapterRegistry`] keyed by
//! channel tag instead of branching per channel.

pub mod adapter;
pub mod connector;
pub mod services;
pub mod types;
pub mod webhook;

pub use {
    adapter::{AdapterRegistry, ChannelAdapter, DedupScope},
    connector::{ConnectorRegistry, ConnectorStore, InMemoryConnectorStore, IntegrationTarget},
    services::{
        AttachmentStore, ContactDirectory, ContactRef, ConversationEvent, InboundSink,
        NoopAttachmentStore, NoopContactDirectory, NoopNotificationSink, NotificationSink,
    },
    types::{
        AttachmentRef, ChannelType, ConversationStatus, Direction, InboundEvent, MessageStatus,
        Metadata, OutboundPayload, RawInbound, SendOutcome, SendRequest, normalize_address,
    },
};
