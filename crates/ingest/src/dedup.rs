//! Inbound deduplication.

use {anyhow::Result, chrono::Duration};

use {
    switchboard_channels::{ChannelAdapter, DedupScope, InboundEvent},
    switchboard_common::time::round_to_second,
    switchboard_config::IngestPolicy,
    switchboard_storage::{Message, MessageRepo},
};

/// Finds a previously-persisted copy of an inbound event.
///
/// Id-bearing payloads dedup by (channel, external id), scoped per target
/// unless the adapter declares cross-target dedup (email). Id-less
/// payloads fall back to a content fingerprint within the configured
/// window, absorbing providers that omit ids on retries.
pub struct DedupEngine {
    messages: MessageRepo,
    policy: IngestPolicy,
}

impl DedupEngine {
    #[must_use]
    pub fn new(messages: MessageRepo, policy: IngestPolicy) -> Self {
        Self { messages, policy }
    }

    pub async fn find_duplicate(
        &self,
        adapter: &dyn ChannelAdapter,
        event: &InboundEvent,
    ) -> Result<Option<Message>> {
        if let Some(external_id) = &event.external_id {
            let scope = match adapter.dedup_scope() {
                DedupScope::CrossTarget => None,
                DedupScope::PerTarget => Some(event.target_id.as_str()),
            };
            return self
                .messages
                .find_inbound_by_external_id(event.channel, external_id, scope)
                .await;
        }

        let window = Duration::seconds(self.policy.fingerprint_window_secs);
        self.messages
            .find_inbound_fingerprint(
                event.channel,
                &event.sender,
                event.subject.as_deref(),
                &event.body,
                round_to_second(event.received_at),
                window,
            )
            .await
    }
}
