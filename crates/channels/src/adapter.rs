//! Channel adapter trait and the registry the engine dispatches through.

use std::{collections::HashMap, sync::Arc};

use {async_trait::async_trait, chrono::Duration};

use switchboard_common::Result;

use crate::{
    connector::IntegrationTarget,
    types::{ChannelType, InboundEvent, OutboundPayload, RawInbound, SendOutcome},
};

/// How inbound dedup is scoped for a channel.
///
/// Email dedups across targets because polling and direct SMTP receipt can
/// observe the same message through different mailboxes; everything else
/// dedups per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupScope {
    PerTarget,
    CrossTarget,
}

/// One implementation per channel type. The normalizer and dispatcher hold
/// a registry of these instead of branching on the channel tag.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> ChannelType;

    fn dedup_scope(&self) -> DedupScope {
        DedupScope::PerTarget
    }

    /// Provider-imposed window after the last customer message during
    /// which outbound sends are legal. `None` means unrestricted.
    fn reply_window(&self) -> Option<Duration> {
        None
    }

    /// Convert a raw provider payload into a canonical inbound event.
    ///
    /// Malformed payloads fail with a validation error; dedup and
    /// self-send suppression happen downstream in the ingest engine.
    fn normalize(&self, raw: &RawInbound, target: &IntegrationTarget) -> Result<InboundEvent>;

    /// Whether a normalized event is the business's own outbound message
    /// echoed back through the inbound path.
    fn is_self_sent(&self, event: &InboundEvent, target: &IntegrationTarget) -> bool;

    /// Deliver one payload through the provider. Never panics and never
    /// returns `Err`: every failure is folded into the outcome.
    async fn send(&self, payload: &OutboundPayload, target: &IntegrationTarget) -> SendOutcome;
}

/// Registry of channel adapters, keyed by channel tag.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ChannelType, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.channel(), adapter);
    }

    #[must_use]
    pub fn get(&self, channel: ChannelType) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<ChannelType> {
        self.adapters.keys().copied().collect()
    }
}
