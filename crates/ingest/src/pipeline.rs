//! The inbound pipeline: connector → normalize → suppress → resolve →
//! persist → notify.

use std::sync::Arc;

use {sqlx::SqlitePool, tracing::{debug, error, warn}};

use {
    switchboard_channels::{
        AdapterRegistry, ConnectorRegistry, ContactDirectory, ConversationEvent, Direction,
        InboundEvent, MessageStatus, NotificationSink, RawInbound,
    },
    switchboard_common::{Error, Result},
    switchboard_config::IngestPolicy,
    switchboard_storage::{
        ContactChannelRepo, Conversation, ConversationRepo, DeadLetterRepo, Message, MessageRepo,
        NewMessage,
    },
};

use crate::{
    dedup::DedupEngine,
    normalize::{has_echo_marker, normalize_external_id},
    resolver::{ConversationResolver, ResolutionCache},
};

/// Why an inbound payload produced no message.
#[derive(Debug, Clone)]
pub enum Suppression {
    /// Already persisted; carries the original so callers stay idempotent.
    Duplicate { original: Message },
    /// The business's own outbound send echoed back through the inbound
    /// path.
    SelfSent,
}

/// Result of feeding one raw payload through the pipeline.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Accepted {
        conversation: Conversation,
        message: Message,
    },
    Suppressed(Suppression),
}

impl IngestOutcome {
    /// The persisted message, for accepted payloads and duplicates.
    #[must_use]
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Accepted { message, .. } => Some(message),
            Self::Suppressed(Suppression::Duplicate { original }) => Some(original),
            Self::Suppressed(Suppression::SelfSent) => None,
        }
    }
}

/// Orchestrates inbound ingestion over the shared store.
pub struct InboundPipeline {
    adapters: Arc<AdapterRegistry>,
    connectors: ConnectorRegistry,
    contacts: Arc<dyn ContactDirectory>,
    sink: Arc<dyn NotificationSink>,
    conversations: ConversationRepo,
    messages: MessageRepo,
    contact_channels: ContactChannelRepo,
    dead_letters: DeadLetterRepo,
    resolver: ConversationResolver,
    dedup: DedupEngine,
    policy: IngestPolicy,
}

impl InboundPipeline {
    #[must_use]
    pub fn new(
        pool: SqlitePool,
        adapters: Arc<AdapterRegistry>,
        connectors: ConnectorRegistry,
        contacts: Arc<dyn ContactDirectory>,
        sink: Arc<dyn NotificationSink>,
        policy: IngestPolicy,
    ) -> Self {
        let conversations = ConversationRepo::new(pool.clone());
        let messages = MessageRepo::new(pool.clone());
        Self {
            adapters,
            connectors,
            contacts,
            sink,
            resolver: ConversationResolver::new(conversations.clone(), messages.clone()),
            dedup: DedupEngine::new(messages.clone(), policy.clone()),
            conversations,
            messages,
            contact_channels: ContactChannelRepo::new(pool.clone()),
            dead_letters: DeadLetterRepo::new(pool),
            policy,
        }
    }

    /// Feed one raw payload through the pipeline.
    ///
    /// Non-retryable failures (malformed payloads, missing configuration)
    /// surface immediately. Retryable failures are re-attempted up to the
    /// pipeline budget, then written to the dead-letter store with the
    /// original payload preserved for manual replay.
    pub async fn ingest(&self, raw: RawInbound) -> Result<IngestOutcome> {
        let attempts = self.policy.pipeline_attempts.max(1);
        let mut last_error: Option<Error> = None;

        for attempt in 1..=attempts {
            match self.ingest_once(&raw).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        channel = %raw.channel,
                        attempt,
                        error = %e,
                        "inbound pipeline attempt failed"
                    );
                    last_error = Some(e);
                },
            }
        }

        let err =
            last_error.unwrap_or_else(|| Error::validation("pipeline attempts exhausted"));
        let payload = serde_json::to_value(&raw)?;
        if let Err(dl_err) = self
            .dead_letters
            .insert(raw.channel, &payload, &err.to_string(), attempts)
            .await
        {
            error!(error = %dl_err, "failed to write dead letter; payload lost from store");
        }
        Err(err)
    }

    async fn ingest_once(&self, raw: &RawInbound) -> Result<IngestOutcome> {
        let adapter = self
            .adapters
            .get(raw.channel)
            .ok_or_else(|| Error::configuration(format!("no adapter for {}", raw.channel)))?;

        let target = self
            .connectors
            .resolve(raw.channel, raw.target_id.as_deref())
            .await?;

        let mut event = adapter.normalize(raw, &target)?;
        event.external_id = event
            .external_id
            .as_deref()
            .and_then(|id| normalize_external_id(id, self.policy.max_external_id_len));

        if has_echo_marker(&event.metadata) || adapter.is_self_sent(&event, &target) {
            debug!(channel = %event.channel, sender = %event.sender, "suppressing self-send");
            return Ok(IngestOutcome::Suppressed(Suppression::SelfSent));
        }

        if let Some(original) = self
            .dedup
            .find_duplicate(adapter.as_ref(), &event)
            .await
            .map_err(storage_error)?
        {
            debug!(
                channel = %event.channel,
                external_id = ?event.external_id,
                original_id = %original.id,
                "suppressing duplicate inbound"
            );
            return Ok(IngestOutcome::Suppressed(Suppression::Duplicate {
                original,
            }));
        }

        let contact = self
            .contacts
            .resolve_or_create(event.channel, &event.sender)
            .await?;
        self.contact_channels
            .upsert(&contact.id, event.channel, &event.sender, false)
            .await
            .map_err(storage_error)?;

        let mut cache = ResolutionCache::new();
        let resolved = self
            .resolver
            .resolve(&mut cache, &event, &contact.id)
            .await
            .map_err(storage_error)?;

        let message = self
            .persist_message(&resolved.conversation, &event)
            .await
            .map_err(storage_error)?;

        self.sink
            .publish(ConversationEvent::MessageReceived {
                conversation_id: resolved.conversation.id.clone(),
                message_id: message.id.clone(),
                channel: event.channel,
            })
            .await;

        Ok(IngestOutcome::Accepted {
            conversation: resolved.conversation,
            message,
        })
    }

    async fn persist_message(
        &self,
        conversation: &Conversation,
        event: &InboundEvent,
    ) -> anyhow::Result<Message> {
        let message = self
            .messages
            .insert(NewMessage {
                conversation_id: conversation.id.clone(),
                channel: event.channel,
                direction: Direction::Inbound,
                status: MessageStatus::Received,
                external_id: event.external_id.clone(),
                subject: event.subject.clone(),
                body: event.body.clone(),
                sender: Some(event.sender.clone()),
                target_id: Some(event.target_id.clone()),
                sent_at: None,
                received_at: Some(event.received_at),
                metadata: event.metadata.clone(),
            })
            .await?;

        self.conversations
            .touch_last_message(&conversation.id, event.received_at.timestamp_millis())
            .await?;

        Ok(message)
    }

    /// Replay a dead letter through the pipeline, deleting it on success.
    pub async fn replay_dead_letter(&self, id: &str) -> Result<IngestOutcome> {
        let letter = self
            .dead_letters
            .get(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| Error::not_found("dead letter", id))?;
        let raw: RawInbound = serde_json::from_value(letter.payload)?;

        let outcome = self.ingest(raw).await?;
        self.dead_letters
            .delete(id)
            .await
            .map_err(storage_error)?;
        Ok(outcome)
    }
}

#[async_trait::async_trait]
impl switchboard_channels::InboundSink for InboundPipeline {
    async fn dispatch_inbound(&self, raw: RawInbound) -> Result<()> {
        self.ingest(raw).await.map(|_| ())
    }
}

fn storage_error(e: anyhow::Error) -> Error {
    Error::External {
        context: "store".into(),
        source: e.into(),
    }
}
