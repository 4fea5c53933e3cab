//! Conversation-thread resolution for canonical inbound events.

use std::{collections::HashMap, sync::LazyLock};

use {anyhow::Result, regex::Regex, tracing::warn};

use {
    switchboard_channels::{ChannelType, ConversationStatus, InboundEvent, Metadata},
    switchboard_storage::{Conversation, ConversationRepo, MessageRepo, NewConversation},
};

use crate::normalize::normalize_external_id;

/// Embedded conversation-id fragment: `conv-1a2b3c4d` in a subject or a
/// plus-addressed recipient.
#[allow(clippy::expect_used)]
static CONV_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)conv-([0-9a-f][0-9a-f-]{5,35})").expect("static regex"));

/// Embedded ticket number: `Ticket #4821`.
#[allow(clippy::expect_used)]
static TICKET_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ticket\s*#\s*(\d+)").expect("static regex"));

/// How a conversation was resolved. Stored as a continuity hint and used
/// to decide whether an unthreaded reply deserves a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    ConversationToken,
    TicketToken,
    ThreadingHeader,
    OpenThread,
    Created,
}

/// A resolved conversation plus how it was found.
#[derive(Debug, Clone)]
pub struct ResolvedConversation {
    pub conversation: Conversation,
    pub source: ResolutionSource,
}

/// Per-operation resolution cache.
///
/// Scoped to one logical ingest operation and passed explicitly through
/// the call chain; never process-global. Repeated token or header lookups
/// within the same operation hit the cache instead of the store.
#[derive(Debug, Default)]
pub struct ResolutionCache {
    by_key: HashMap<String, Option<String>>,
}

impl ResolutionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Option<&Option<String>> {
        self.by_key.get(key)
    }

    fn put(&mut self, key: String, conversation_id: Option<String>) {
        self.by_key.insert(key, conversation_id);
    }
}

/// Binds a canonical inbound event to an existing or new conversation.
pub struct ConversationResolver {
    conversations: ConversationRepo,
    messages: MessageRepo,
}

impl ConversationResolver {
    #[must_use]
    pub fn new(conversations: ConversationRepo, messages: MessageRepo) -> Self {
        Self {
            conversations,
            messages,
        }
    }

    /// Resolve the conversation an inbound event belongs to, creating one
    /// when the contact has no open thread on the channel.
    ///
    /// Side effects on the resolved conversation: a non-open thread is
    /// reopened, and an email reply that lands on the open thread without
    /// any continuity signal gets a non-fatal warning annotation.
    pub async fn resolve(
        &self,
        cache: &mut ResolutionCache,
        event: &InboundEvent,
        contact_id: &str,
    ) -> Result<ResolvedConversation> {
        let mut resolved = self.locate(cache, event, contact_id).await?;

        if resolved.conversation.contact_id != contact_id {
            // Ambiguous ownership is a human decision; log, don't correct.
            warn!(
                conversation_id = %resolved.conversation.id,
                expected_contact = contact_id,
                actual_contact = %resolved.conversation.contact_id,
                "inbound message resolved to a conversation owned by another contact"
            );
        }

        if resolved.conversation.status != ConversationStatus::Open {
            self.conversations
                .set_status(&resolved.conversation.id, ConversationStatus::Open)
                .await?;
            resolved.conversation.status = ConversationStatus::Open;
        }

        if resolved.source == ResolutionSource::OpenThread
            && event.channel == ChannelType::Email
            && looks_like_reply(event)
        {
            let mut patch = Metadata::new();
            patch.insert(
                "continuity_warning".into(),
                serde_json::json!("reply attached to open conversation without a thread token"),
            );
            self.conversations
                .merge_metadata(&resolved.conversation.id, &patch)
                .await?;
            for (key, value) in patch {
                resolved.conversation.metadata.insert(key, value);
            }
        }

        Ok(resolved)
    }

    async fn locate(
        &self,
        cache: &mut ResolutionCache,
        event: &InboundEvent,
        contact_id: &str,
    ) -> Result<ResolvedConversation> {
        if event.channel == ChannelType::Email {
            if let Some(found) = self.by_embedded_tokens(cache, event).await? {
                return Ok(found);
            }
            if let Some(found) = self.by_threading_headers(cache, event).await? {
                return Ok(found);
            }
        }

        if let Some(open) = self
            .conversations
            .find_open(contact_id, event.channel)
            .await?
        {
            return Ok(ResolvedConversation {
                conversation: open,
                source: ResolutionSource::OpenThread,
            });
        }

        let created = self
            .conversations
            .insert(NewConversation {
                contact_id: contact_id.to_string(),
                channel: event.channel,
                subject: event.subject.clone(),
                metadata: Metadata::new(),
            })
            .await?;
        Ok(ResolvedConversation {
            conversation: created,
            source: ResolutionSource::Created,
        })
    }

    /// Step 1: `conv-<uuid-fragment>` / `ticket #<id>` tokens in the
    /// subject or in Reply-To/To/Cc addresses.
    async fn by_embedded_tokens(
        &self,
        cache: &mut ResolutionCache,
        event: &InboundEvent,
    ) -> Result<Option<ResolvedConversation>> {
        let haystacks = token_haystacks(event);

        for text in &haystacks {
            for capture in CONV_TOKEN.captures_iter(text) {
                let fragment = capture[1].to_lowercase();
                let key = format!("conv:{fragment}");
                let id = match cache.get(&key) {
                    Some(cached) => cached.clone(),
                    None => {
                        let hit = self.conversations.find_by_id_prefix(&fragment).await?;
                        let id = hit.map(|c| c.id);
                        cache.put(key, id.clone());
                        id
                    },
                };
                if let Some(id) = id
                    && let Some(conversation) = self.conversations.get(&id).await?
                {
                    return Ok(Some(ResolvedConversation {
                        conversation,
                        source: ResolutionSource::ConversationToken,
                    }));
                }
            }
        }

        for text in &haystacks {
            for capture in TICKET_TOKEN.captures_iter(text) {
                let number = capture[1].to_string();
                let key = format!("ticket:{number}");
                let id = match cache.get(&key) {
                    Some(cached) => cached.clone(),
                    None => {
                        let hit = self.conversations.find_by_subject_token(&number).await?;
                        let id = hit.map(|c| c.id);
                        cache.put(key, id.clone());
                        id
                    },
                };
                if let Some(id) = id
                    && let Some(conversation) = self.conversations.get(&id).await?
                {
                    return Ok(Some(ResolvedConversation {
                        conversation,
                        source: ResolutionSource::TicketToken,
                    }));
                }
            }
        }

        Ok(None)
    }

    /// Step 2: `In-Reply-To` / `References` headers pointing at a message
    /// we already hold, inbound or outbound.
    async fn by_threading_headers(
        &self,
        cache: &mut ResolutionCache,
        event: &InboundEvent,
    ) -> Result<Option<ResolvedConversation>> {
        for referenced in threading_ids(event) {
            let key = format!("ref:{referenced}");
            let id = match cache.get(&key) {
                Some(cached) => cached.clone(),
                None => {
                    let hit = self
                        .messages
                        .find_by_external_id(event.channel, &referenced)
                        .await?;
                    let id = hit.map(|m| m.conversation_id);
                    cache.put(key, id.clone());
                    id
                },
            };
            if let Some(id) = id
                && let Some(conversation) = self.conversations.get(&id).await?
            {
                return Ok(Some(ResolvedConversation {
                    conversation,
                    source: ResolutionSource::ThreadingHeader,
                }));
            }
        }
        Ok(None)
    }
}

/// Subject plus any address-bearing metadata fields token patterns may
/// hide in.
fn token_haystacks(event: &InboundEvent) -> Vec<String> {
    let mut haystacks = Vec::new();
    if let Some(subject) = &event.subject {
        haystacks.push(subject.clone());
    }
    for field in ["reply_to", "to", "cc"] {
        match event.metadata.get(field) {
            Some(serde_json::Value::String(s)) => haystacks.push(s.clone()),
            Some(serde_json::Value::Array(items)) => {
                haystacks.extend(items.iter().filter_map(|v| v.as_str().map(String::from)));
            },
            _ => {},
        }
    }
    haystacks
}

/// Normalized message ids from `In-Reply-To` and `References` metadata.
fn threading_ids(event: &InboundEvent) -> Vec<String> {
    let mut ids = Vec::new();
    for field in ["in_reply_to", "references"] {
        match event.metadata.get(field) {
            Some(serde_json::Value::String(s)) => {
                ids.extend(s.split_whitespace().filter_map(|part| {
                    normalize_external_id(part, usize::MAX)
                }));
            },
            Some(serde_json::Value::Array(items)) => {
                ids.extend(
                    items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .filter_map(|s| normalize_external_id(s, usize::MAX)),
                );
            },
            _ => {},
        }
    }
    ids
}

/// Whether an email event reads as a reply: `Re:` subject or a threading
/// header that failed to resolve.
fn looks_like_reply(event: &InboundEvent) -> bool {
    let subject_says_reply = event
        .subject
        .as_deref()
        .is_some_and(|s| s.trim_start().to_lowercase().starts_with("re:"));
    subject_says_reply || !threading_ids(event).is_empty()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn conv_token_extraction() {
        let caps = CONV_TOKEN.captures("Fwd: conv-1a2b3c4d follow-up").unwrap();
        assert_eq!(&caps[1], "1a2b3c4d");
    }

    #[test]
    fn ticket_token_extraction() {
        let caps = TICKET_TOKEN.captures("Re: Ticket #4821").unwrap();
        assert_eq!(&caps[1], "4821");
        let caps = TICKET_TOKEN.captures("ticket  # 77").unwrap();
        assert_eq!(&caps[1], "77");
    }

    #[test]
    fn haystacks_include_address_metadata() {
        let mut metadata = Metadata::new();
        metadata.insert(
            "reply_to".into(),
            serde_json::json!("support+conv-9f8e7d6c@hub.example"),
        );
        metadata.insert(
            "cc".into(),
            serde_json::json!(["ops@hub.example", "audit@hub.example"]),
        );
        let event = InboundEvent {
            channel: ChannelType::Email,
            target_id: "mailbox-1".into(),
            sender: "kim@example.com".into(),
            external_id: None,
            subject: Some("hello".into()),
            body: String::new(),
            received_at: chrono::Utc::now(),
            metadata,
        };

        let haystacks = token_haystacks(&event);
        assert_eq!(haystacks.len(), 4);
        assert!(haystacks.iter().any(|h| h.contains("conv-9f8e7d6c")));
    }

    #[test]
    fn threading_ids_strip_brackets() {
        let mut metadata = Metadata::new();
        metadata.insert("in_reply_to".into(), serde_json::json!("<a@x>"));
        metadata.insert("references".into(), serde_json::json!("<b@x> <c@x>"));
        let event = InboundEvent {
            channel: ChannelType::Email,
            target_id: "mailbox-1".into(),
            sender: "kim@example.com".into(),
            external_id: None,
            subject: None,
            body: String::new(),
            received_at: chrono::Utc::now(),
            metadata,
        };

        let ids = threading_ids(&event);
        assert_eq!(ids, vec!["a@x", "b@x", "c@x"]);
    }

    #[test]
    fn reply_detection() {
        let mut event = InboundEvent {
            channel: ChannelType::Email,
            target_id: "mailbox-1".into(),
            sender: "kim@example.com".into(),
            external_id: None,
            subject: Some("  re: outage".into()),
            body: String::new(),
            received_at: chrono::Utc::now(),
            metadata: Metadata::new(),
        };
        assert!(looks_like_reply(&event));

        event.subject = Some("fresh request".into());
        assert!(!looks_like_reply(&event));

        event
            .metadata
            .insert("in_reply_to".into(), serde_json::json!("<gone@x>"));
        assert!(looks_like_reply(&event));
    }
}
