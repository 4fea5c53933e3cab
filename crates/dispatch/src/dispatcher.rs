//! The outbound dispatcher: legality checks, message persistence, and the
//! channel send itself.

use std::sync::Arc;

use {
    chrono::Utc,
    sqlx::SqlitePool,
    tracing::{debug, warn},
};

use {
    switchboard_channels::{
        AdapterRegistry, ConnectorRegistry, ConversationEvent, Direction, MessageStatus,
        NotificationSink, OutboundPayload, SendOutcome, SendRequest,
    },
    switchboard_common::{Error, Result},
    switchboard_outbox::{DispatchFn, DispatchResult, OutboxMessage},
    switchboard_storage::{ConversationRepo, Message, MessageRepo, NewMessage},
};

use crate::template::render;

/// A completed dispatch: the persisted outbound message and how the
/// provider responded.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub message: Message,
    pub outcome: SendOutcome,
}

/// Turns an accepted send request into exactly one persisted outbound
/// Message whose terminal status reflects the provider outcome.
///
/// Retries of the same logical send go through the outbox queue; calling
/// [`Dispatcher::dispatch`] twice is two attempts and two message rows.
pub struct Dispatcher {
    adapters: Arc<AdapterRegistry>,
    connectors: ConnectorRegistry,
    sink: Arc<dyn NotificationSink>,
    conversations: ConversationRepo,
    messages: MessageRepo,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        pool: SqlitePool,
        adapters: Arc<AdapterRegistry>,
        connectors: ConnectorRegistry,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            adapters,
            connectors,
            sink,
            conversations: ConversationRepo::new(pool.clone()),
            messages: MessageRepo::new(pool),
        }
    }

    /// Run all legality checks, persist the outbound message, and invoke
    /// the channel sender.
    ///
    /// Rejections (unknown conversation, channel mismatch, expired reply
    /// window) fail before any row or provider call. Provider failures
    /// never propagate as errors: the message lands as `failed` with the
    /// recorded error and the outcome says whether a retry is worthwhile.
    pub async fn dispatch(&self, request: &SendRequest) -> Result<Dispatched> {
        let adapter = self
            .adapters
            .get(request.channel)
            .ok_or_else(|| Error::configuration(format!("no adapter for {}", request.channel)))?;

        let conversation = self
            .conversations
            .get(&request.conversation_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| Error::not_found("conversation", &request.conversation_id))?;

        let last_inbound = self
            .messages
            .last_inbound(&conversation.id)
            .await
            .map_err(store_error)?;

        // Reply-channel binding: the reply uses the channel (and pinned
        // target) of the most recent inbound message.
        let mut pinned_target = request.target_id.clone();
        if let Some(inbound) = &last_inbound {
            if inbound.channel != request.channel {
                return Err(Error::validation(format!(
                    "conversation last heard from the contact on {}, cannot reply via {}",
                    inbound.channel, request.channel
                )));
            }
            if let (Some(requested), Some(bound)) = (&request.target_id, &inbound.target_id)
                && requested != bound
            {
                return Err(Error::validation(format!(
                    "reply must use channel target {bound}, not {requested}"
                )));
            }
            if pinned_target.is_none() {
                pinned_target = inbound.target_id.clone();
            }
        } else if conversation.channel != request.channel {
            return Err(Error::validation(format!(
                "conversation belongs to {}, cannot reply via {}",
                conversation.channel, request.channel
            )));
        }

        // Reply window: enforced locally so an expired send fails fast
        // and cheaply, independent of provider-side enforcement.
        if let Some(window) = adapter.reply_window() {
            let within = last_inbound
                .as_ref()
                .and_then(|m| m.received_at)
                .is_some_and(|received| Utc::now() - received <= window);
            if !within {
                return Err(Error::permanent(format!(
                    "reply window of {}h expired for {}",
                    window.num_hours(),
                    request.channel
                )));
            }
        }

        let recipient = last_inbound
            .as_ref()
            .and_then(|m| m.sender.clone())
            .ok_or_else(|| {
                Error::validation("conversation has no inbound message to derive a recipient from")
            })?;

        let target = self
            .connectors
            .resolve(request.channel, pinned_target.as_deref())
            .await?;

        let payload = OutboundPayload {
            recipient,
            subject: request
                .subject
                .as_deref()
                .map(|s| render(s, &request.variables)),
            body: render(&request.body, &request.variables),
            attachments: request.attachments.clone(),
            in_reply_to: last_inbound.as_ref().and_then(|m| m.external_id.clone()),
        };

        let message = self
            .messages
            .insert(NewMessage {
                conversation_id: conversation.id.clone(),
                channel: request.channel,
                direction: Direction::Outbound,
                status: MessageStatus::Queued,
                external_id: None,
                subject: payload.subject.clone(),
                body: payload.body.clone(),
                sender: Some(payload.recipient.clone()),
                target_id: Some(target.id.clone()),
                sent_at: None,
                received_at: None,
                metadata: Default::default(),
            })
            .await
            .map_err(store_error)?;

        let outcome = adapter.send(&payload, &target).await;

        match &outcome {
            SendOutcome::Sent { provider_id } => {
                let now = Utc::now();
                self.messages
                    .mark_sent(&message.id, provider_id.as_deref(), now)
                    .await
                    .map_err(store_error)?;
                self.conversations
                    .touch_last_message(&conversation.id, now.timestamp_millis())
                    .await
                    .map_err(store_error)?;
                debug!(
                    message_id = %message.id,
                    channel = %request.channel,
                    "outbound message sent"
                );
                self.sink
                    .publish(ConversationEvent::MessageSent {
                        conversation_id: conversation.id.clone(),
                        message_id: message.id.clone(),
                        channel: request.channel,
                    })
                    .await;
            },
            SendOutcome::Transient { error } | SendOutcome::Permanent { error } => {
                self.messages
                    .mark_failed(&message.id, error)
                    .await
                    .map_err(store_error)?;
                warn!(
                    message_id = %message.id,
                    channel = %request.channel,
                    error,
                    "outbound message failed"
                );
                self.sink
                    .publish(ConversationEvent::MessageFailed {
                        conversation_id: conversation.id.clone(),
                        message_id: message.id.clone(),
                        channel: request.channel,
                        error: error.clone(),
                    })
                    .await;
            },
        }

        let message = self
            .messages
            .get(&message.id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| Error::not_found("message", &message.id))?;
        Ok(Dispatched { message, outcome })
    }

    /// Adapt this dispatcher into the outbox worker's callback.
    ///
    /// Pre-send rejections become permanent or transient outcomes by
    /// their retryability, so the queue worker can branch without
    /// exception plumbing.
    #[must_use]
    pub fn dispatch_fn(self: &Arc<Self>) -> DispatchFn {
        let dispatcher = Arc::clone(self);
        Arc::new(move |entry: OutboxMessage| {
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move {
                match dispatcher.dispatch(&entry.payload).await {
                    Ok(dispatched) => DispatchResult {
                        outcome: dispatched.outcome,
                        message_id: Some(dispatched.message.id),
                    },
                    Err(e) if e.is_retryable() => DispatchResult {
                        outcome: SendOutcome::Transient {
                            error: e.to_string(),
                        },
                        message_id: None,
                    },
                    Err(e) => DispatchResult {
                        outcome: SendOutcome::Permanent {
                            error: e.to_string(),
                        },
                        message_id: None,
                    },
                }
            })
        })
    }
}

fn store_error(e: anyhow::Error) -> Error {
    Error::External {
        context: "store".into(),
        source: e.into(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Mutex;

    use {async_trait::async_trait, chrono::Duration};

    use {
        switchboard_channels::{
            ChannelAdapter, ChannelType, InMemoryConnectorStore, InboundEvent, IntegrationTarget,
            Metadata, RawInbound,
        },
        switchboard_storage::connect,
    };

    use super::*;

    struct RecordingAdapter {
        channel: ChannelType,
        window: Option<Duration>,
        outcome: SendOutcome,
        sends: Mutex<Vec<OutboundPayload>>,
    }

    impl RecordingAdapter {
        fn new(channel: ChannelType, window: Option<Duration>, outcome: SendOutcome) -> Arc<Self> {
            Arc::new(Self {
                channel,
                window,
                outcome,
                sends: Mutex::new(Vec::new()),
            })
        }

        fn send_count(&self) -> usize {
            self.sends.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        fn channel(&self) -> ChannelType {
            self.channel
        }

        fn reply_window(&self) -> Option<Duration> {
            self.window
        }

        fn normalize(
            &self,
            _raw: &RawInbound,
            _target: &IntegrationTarget,
        ) -> Result<InboundEvent> {
            Err(Error::validation("not used in dispatch tests"))
        }

        fn is_self_sent(&self, _event: &InboundEvent, _target: &IntegrationTarget) -> bool {
            false
        }

        async fn send(
            &self,
            payload: &OutboundPayload,
            _target: &IntegrationTarget,
        ) -> SendOutcome {
            self.sends.lock().unwrap().push(payload.clone());
            self.outcome.clone()
        }
    }

    struct SilentSink;

    #[async_trait]
    impl NotificationSink for SilentSink {
        async fn publish(&self, _event: ConversationEvent) {}
    }

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        conversations: ConversationRepo,
        messages: MessageRepo,
        whatsapp: Arc<RecordingAdapter>,
        instagram: Arc<RecordingAdapter>,
    }

    async fn fixture(whatsapp_outcome: SendOutcome) -> Fixture {
        let pool = connect("sqlite::memory:").await.unwrap();

        let whatsapp = RecordingAdapter::new(ChannelType::Whatsapp, None, whatsapp_outcome);
        let instagram = RecordingAdapter::new(
            ChannelType::InstagramDm,
            Some(Duration::hours(24)),
            SendOutcome::Sent { provider_id: None },
        );

        let mut adapters = AdapterRegistry::new();
        adapters.register(whatsapp.clone());
        adapters.register(instagram.clone());

        let connectors = ConnectorRegistry::new(Arc::new(InMemoryConnectorStore::new(vec![
            IntegrationTarget {
                id: "wa-main".into(),
                channel: ChannelType::Whatsapp,
                name: "main number".into(),
                outbound_addresses: vec!["4915100000".into()],
                routing_key: Some("phone-id-1".into()),
                is_default: true,
                config: serde_json::json!({}),
            },
            IntegrationTarget {
                id: "wa-support".into(),
                channel: ChannelType::Whatsapp,
                name: "support number".into(),
                outbound_addresses: vec!["4915200000".into()],
                routing_key: Some("phone-id-2".into()),
                is_default: false,
                config: serde_json::json!({}),
            },
            IntegrationTarget {
                id: "ig-main".into(),
                channel: ChannelType::InstagramDm,
                name: "brand account".into(),
                outbound_addresses: vec![],
                routing_key: Some("ig-page-1".into()),
                is_default: true,
                config: serde_json::json!({}),
            },
        ])));

        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            Arc::new(adapters),
            connectors,
            Arc::new(SilentSink),
        ));

        Fixture {
            dispatcher,
            conversations: ConversationRepo::new(pool.clone()),
            messages: MessageRepo::new(pool),
            whatsapp,
            instagram,
        }
    }

    /// Seed a conversation with one inbound message received `age` ago.
    async fn seed(
        f: &Fixture,
        channel: ChannelType,
        target_id: &str,
        age: Duration,
    ) -> String {
        let conversation = f
            .conversations
            .insert(switchboard_storage::NewConversation {
                contact_id: "contact-1".into(),
                channel,
                subject: None,
                metadata: Metadata::new(),
            })
            .await
            .unwrap();
        f.messages
            .insert(NewMessage {
                conversation_id: conversation.id.clone(),
                channel,
                direction: Direction::Inbound,
                status: MessageStatus::Received,
                external_id: Some("inbound-1".into()),
                subject: None,
                body: "when is the tech coming?".into(),
                sender: Some("4915199999".into()),
                target_id: Some(target_id.into()),
                sent_at: None,
                received_at: Some(Utc::now() - age),
                metadata: Metadata::new(),
            })
            .await
            .unwrap();
        conversation.id
    }

    fn request(conversation_id: &str, channel: ChannelType) -> SendRequest {
        SendRequest {
            conversation_id: conversation_id.into(),
            channel,
            target_id: None,
            body: "arriving at {{slot}}".into(),
            subject: None,
            attachments: vec![],
            variables: [("slot".to_string(), "14:00".to_string())].into(),
        }
    }

    #[tokio::test]
    async fn successful_send_persists_one_sent_message() {
        let f = fixture(SendOutcome::Sent {
            provider_id: Some("wamid.out".into()),
        })
        .await;
        let conversation_id =
            seed(&f, ChannelType::Whatsapp, "wa-main", Duration::minutes(5)).await;

        let dispatched = f
            .dispatcher
            .dispatch(&request(&conversation_id, ChannelType::Whatsapp))
            .await
            .unwrap();

        assert!(dispatched.outcome.is_sent());
        assert_eq!(dispatched.message.status, MessageStatus::Sent);
        assert_eq!(dispatched.message.external_id.as_deref(), Some("wamid.out"));
        assert_eq!(dispatched.message.target_id.as_deref(), Some("wa-main"));

        // Personalization reached the provider payload, replies are
        // threaded, and the recipient came from the last inbound sender.
        let sends = f.whatsapp.sends.lock().unwrap();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].body, "arriving at 14:00");
        assert_eq!(sends[0].recipient, "4915199999");
        assert_eq!(sends[0].in_reply_to.as_deref(), Some("inbound-1"));
    }

    #[tokio::test]
    async fn reply_must_use_inbound_channel() {
        let f = fixture(SendOutcome::Sent { provider_id: None }).await;
        let conversation_id =
            seed(&f, ChannelType::Whatsapp, "wa-main", Duration::minutes(5)).await;

        let err = f
            .dispatcher
            .dispatch(&request(&conversation_id, ChannelType::InstagramDm))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(f.instagram.send_count(), 0);
        assert_eq!(f.whatsapp.send_count(), 0);
    }

    #[tokio::test]
    async fn reply_must_use_bound_target() {
        let f = fixture(SendOutcome::Sent { provider_id: None }).await;
        let conversation_id =
            seed(&f, ChannelType::Whatsapp, "wa-main", Duration::minutes(5)).await;

        let mut req = request(&conversation_id, ChannelType::Whatsapp);
        req.target_id = Some("wa-support".into());

        let err = f.dispatcher.dispatch(&req).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(f.whatsapp.send_count(), 0);
    }

    #[tokio::test]
    async fn expired_reply_window_rejects_before_any_provider_call() {
        let f = fixture(SendOutcome::Sent { provider_id: None }).await;
        // Last inbound DM is 25 hours old.
        let conversation_id =
            seed(&f, ChannelType::InstagramDm, "ig-main", Duration::hours(25)).await;

        let err = f
            .dispatcher
            .dispatch(&request(&conversation_id, ChannelType::InstagramDm))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermanentProvider { .. }));
        assert_eq!(f.instagram.send_count(), 0);

        // No message row was created for the rejected send.
        let listed = f.messages.list_for_conversation(&conversation_id).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn fresh_reply_window_allows_send() {
        let f = fixture(SendOutcome::Sent { provider_id: None }).await;
        let conversation_id =
            seed(&f, ChannelType::InstagramDm, "ig-main", Duration::hours(23)).await;

        let dispatched = f
            .dispatcher
            .dispatch(&request(&conversation_id, ChannelType::InstagramDm))
            .await
            .unwrap();
        assert!(dispatched.outcome.is_sent());
        assert_eq!(f.instagram.send_count(), 1);
    }

    #[tokio::test]
    async fn provider_failure_leaves_visible_failed_message() {
        let f = fixture(SendOutcome::Transient {
            error: "503 from graph".into(),
        })
        .await;
        let conversation_id =
            seed(&f, ChannelType::Whatsapp, "wa-main", Duration::minutes(5)).await;

        let dispatched = f
            .dispatcher
            .dispatch(&request(&conversation_id, ChannelType::Whatsapp))
            .await
            .unwrap();

        assert!(!dispatched.outcome.is_sent());
        assert_eq!(dispatched.message.status, MessageStatus::Failed);
        assert_eq!(
            dispatched.message.metadata.get("error"),
            Some(&serde_json::json!("503 from graph"))
        );
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let f = fixture(SendOutcome::Sent { provider_id: None }).await;
        let err = f
            .dispatcher
            .dispatch(&request("missing", ChannelType::Whatsapp))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn dispatch_fn_folds_rejections_into_outcomes() {
        let f = fixture(SendOutcome::Sent { provider_id: None }).await;
        let conversation_id =
            seed(&f, ChannelType::InstagramDm, "ig-main", Duration::hours(25)).await;

        let dispatch = f.dispatcher.dispatch_fn();
        let store = switchboard_outbox::OutboxStore::new("sqlite::memory:")
            .await
            .unwrap();
        let entry = store
            .enqueue(
                &request(&conversation_id, ChannelType::InstagramDm),
                "k-1",
                0,
            )
            .await
            .unwrap()
            .entry;

        let result = dispatch(entry).await;
        assert!(matches!(result.outcome, SendOutcome::Permanent { .. }));
        assert!(result.message_id.is_none());
    }
}
