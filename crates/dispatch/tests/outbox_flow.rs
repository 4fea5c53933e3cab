//! End-to-end outbound flow: idempotent enqueue, worker claim, dispatch,
//! and terminal status recording.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use {async_trait::async_trait, chrono::Utc};

use {
    switchboard_channels::{
        AdapterRegistry, ChannelAdapter, ChannelType, ConnectorRegistry, ConversationEvent,
        Direction, InMemoryConnectorStore, InboundEvent, IntegrationTarget, MessageStatus,
        Metadata, NotificationSink, OutboundPayload, RawInbound, SendOutcome, SendRequest,
    },
    switchboard_common::Result,
    switchboard_config::OutboxPolicy,
    switchboard_dispatch::Dispatcher,
    switchboard_outbox::{OutboxStatus, OutboxStore, OutboxWorker},
    switchboard_storage::{
        ConversationRepo, MessageRepo, NewConversation, NewMessage, connect,
    },
};

struct CountingAdapter {
    sends: AtomicUsize,
}

#[async_trait]
impl ChannelAdapter for CountingAdapter {
    fn channel(&self) -> ChannelType {
        ChannelType::Whatsapp
    }

    fn normalize(&self, _raw: &RawInbound, _target: &IntegrationTarget) -> Result<InboundEvent> {
        unreachable!("outbound-only test adapter")
    }

    fn is_self_sent(&self, _event: &InboundEvent, _target: &IntegrationTarget) -> bool {
        false
    }

    async fn send(&self, _payload: &OutboundPayload, _target: &IntegrationTarget) -> SendOutcome {
        self.sends.fetch_add(1, Ordering::SeqCst);
        SendOutcome::Sent {
            provider_id: Some("wamid.OUT".into()),
        }
    }
}

struct CaptureSink {
    events: Mutex<Vec<ConversationEvent>>,
}

#[async_trait]
impl NotificationSink for CaptureSink {
    async fn publish(&self, event: ConversationEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn enqueue_twice_sends_exactly_once() {
    let pool = connect("sqlite::memory:").await.unwrap();
    let conversations = ConversationRepo::new(pool.clone());
    let messages = MessageRepo::new(pool.clone());

    let conversation = conversations
        .insert(NewConversation {
            contact_id: "contact-1".into(),
            channel: ChannelType::Whatsapp,
            subject: None,
            metadata: Metadata::new(),
        })
        .await
        .unwrap();
    messages
        .insert(NewMessage {
            conversation_id: conversation.id.clone(),
            channel: ChannelType::Whatsapp,
            direction: Direction::Inbound,
            status: MessageStatus::Received,
            external_id: Some("wamid.IN".into()),
            subject: None,
            body: "is my install confirmed?".into(),
            sender: Some("4915199999".into()),
            target_id: Some("wa-main".into()),
            sent_at: None,
            received_at: Some(Utc::now()),
            metadata: Metadata::new(),
        })
        .await
        .unwrap();

    let adapter = Arc::new(CountingAdapter {
        sends: AtomicUsize::new(0),
    });
    let mut adapters = AdapterRegistry::new();
    adapters.register(adapter.clone());

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
    ])));

    let sink = Arc::new(CaptureSink {
        events: Mutex::new(Vec::new()),
    });
    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        Arc::new(adapters),
        connectors,
        sink.clone(),
    ));

    let outbox = OutboxStore::with_pool(pool.clone());
    switchboard_outbox::run_migrations(&pool).await.unwrap();
    let worker = OutboxWorker::new(
        outbox.clone(),
        OutboxPolicy::default(),
        dispatcher.dispatch_fn(),
    );

    let request = SendRequest {
        conversation_id: conversation.id.clone(),
        channel: ChannelType::Whatsapp,
        target_id: None,
        body: "confirmed for {{day}}".into(),
        subject: None,
        attachments: vec![],
        variables: [("day".to_string(), "Tuesday".to_string())].into(),
    };

    // The same logical send submitted twice.
    let first = outbox.enqueue(&request, "send-install-confirm", 0).await.unwrap();
    let second = outbox.enqueue(&request, "send-install-confirm", 0).await.unwrap();
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.entry.id, second.entry.id);

    let processed = worker.run_once(Utc::now()).await.unwrap();
    assert_eq!(processed, 1);

    // Exactly one provider call and one sent outbox entry.
    assert_eq!(adapter.sends.load(Ordering::SeqCst), 1);
    let entry = outbox.get(&first.entry.id).await.unwrap().unwrap();
    assert_eq!(entry.status, OutboxStatus::Sent);
    let sent_message_id = entry.message_id.clone().unwrap();

    // The persisted message is terminal, rendered, and threaded.
    let message = messages.get(&sent_message_id).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.body, "confirmed for Tuesday");
    assert_eq!(message.external_id.as_deref(), Some("wamid.OUT"));

    // Re-enqueueing after success returns the sent entry without another
    // provider call.
    let replay = outbox.enqueue(&request, "send-install-confirm", 0).await.unwrap();
    assert!(!replay.created);
    assert_eq!(replay.entry.status, OutboxStatus::Sent);
    assert_eq!(worker.run_once(Utc::now()).await.unwrap(), 0);
    assert_eq!(adapter.sends.load(Ordering::SeqCst), 1);

    // Exactly one MessageSent event reached the fan-out.
    let events = sink.events.lock().unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ConversationEvent::MessageSent { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn conversation_messages_stay_in_timestamp_order() {
    let pool = connect("sqlite::memory:").await.unwrap();
    let conversations = ConversationRepo::new(pool.clone());
    let messages = MessageRepo::new(pool.clone());

    let conversation = conversations
        .insert(NewConversation {
            contact_id: "contact-1".into(),
            channel: ChannelType::Whatsapp,
            subject: None,
            metadata: Metadata::new(),
        })
        .await
        .unwrap();

    // Poll lag: the inbound arrives in the store after the reply was
    // sent, but carries the earlier timestamp.
    let base = Utc::now();
    messages
        .insert(NewMessage {
            conversation_id: conversation.id.clone(),
            channel: ChannelType::Whatsapp,
            direction: Direction::Outbound,
            status: MessageStatus::Sent,
            external_id: None,
            subject: None,
            body: "reply".into(),
            sender: Some("4915199999".into()),
            target_id: Some("wa-main".into()),
            sent_at: Some(base),
            received_at: None,
            metadata: Metadata::new(),
        })
        .await
        .unwrap();
    messages
        .insert(NewMessage {
            conversation_id: conversation.id.clone(),
            channel: ChannelType::Whatsapp,
            direction: Direction::Inbound,
            status: MessageStatus::Received,
            external_id: Some("late-observed".into()),
            subject: None,
            body: "original question".into(),
            sender: Some("4915199999".into()),
            target_id: Some("wa-main".into()),
            sent_at: None,
            received_at: Some(base - chrono::Duration::minutes(2)),
            metadata: Metadata::new(),
        })
        .await
        .unwrap();

    let listed = messages.list_for_conversation(&conversation.id).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].body, "original question");
    assert_eq!(listed[1].body, "reply");
}
