//! Messenger / Instagram webhook payloads and per-event fan-out.

use {
    serde::Deserialize,
    tracing::{debug, warn},
};

use switchboard_channels::{ChannelType, Metadata, RawInbound};
use switchboard_common::time::from_ms;

/// Top-level Meta messaging webhook payload. `object` is `page` for
/// Messenger and `instagram` for Instagram DMs.
#[derive(Debug, Clone, Deserialize)]
pub struct MetaWebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<MetaEntry>,
}

impl MetaWebhookPayload {
    /// The channel this payload belongs to, by its `object` marker.
    #[must_use]
    pub fn channel(&self) -> Option<ChannelType> {
        match self.object.as_str() {
            "page" => Some(ChannelType::FacebookMessenger),
            "instagram" => Some(ChannelType::InstagramDm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaEntry {
    /// Page or Instagram business-account id.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagingEvent {
    pub sender: Option<Participant>,
    pub recipient: Option<Participant>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    pub message: Option<MessagePart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Participant {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePart {
    #[serde(default)]
    pub mid: String,
    pub text: Option<String>,
    /// Meta echoes the page's own sends back through the webhook with
    /// this flag set.
    #[serde(default)]
    pub is_echo: bool,
}

/// Fan a Meta payload out into raw inbound events, one per messaging
/// event. Entries for a different page/account id are skipped.
pub fn fan_out(
    payload: &MetaWebhookPayload,
    channel: ChannelType,
    target_id: &str,
    page_id: &str,
) -> Vec<RawInbound> {
    let mut events = Vec::new();

    for entry in &payload.entry {
        if entry.id != page_id {
            warn!(expected = %page_id, received = %entry.id, "page id mismatch, skipping entry");
            continue;
        }

        for event in &entry.messaging {
            let Some(message) = &event.message else {
                debug!("ignoring messaging event without a message part");
                continue;
            };
            let Some(sender) = &event.sender else {
                debug!("ignoring messaging event without a sender");
                continue;
            };
            let Some(text) = message.text.clone().filter(|t| !t.is_empty()) else {
                debug!(mid = %message.mid, "ignoring non-text messaging event");
                continue;
            };

            let mut metadata = Metadata::new();
            if message.is_echo {
                metadata.insert("is_echo".into(), serde_json::Value::Bool(true));
            }
            if let Some(recipient) = &event.recipient {
                metadata.insert(
                    "recipient_id".into(),
                    serde_json::Value::String(recipient.id.clone()),
                );
            }

            events.push(RawInbound {
                channel,
                target_id: Some(target_id.to_string()),
                sender: sender.id.clone(),
                external_id: (!message.mid.is_empty()).then(|| message.mid.clone()),
                subject: None,
                body: text,
                received_at: (event.timestamp > 0).then(|| from_ms(event.timestamp)),
                metadata,
            });
        }
    }

    events
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample() -> MetaWebhookPayload {
        serde_json::from_value(serde_json::json!({
            "object": "instagram",
            "entry": [{
                "id": "ig-page-1",
                "messaging": [{
                    "sender": { "id": "user-77" },
                    "recipient": { "id": "ig-page-1" },
                    "timestamp": 1700000000000i64,
                    "message": {
                        "mid": "mid.AAA",
                        "text": "is the outage fixed?"
                    }
                }, {
                    "sender": { "id": "ig-page-1" },
                    "recipient": { "id": "user-77" },
                    "timestamp": 1700000001000i64,
                    "message": {
                        "mid": "mid.BBB",
                        "text": "yes, back online",
                        "is_echo": true
                    }
                }, {
                    "sender": { "id": "user-77" },
                    "timestamp": 1700000002000i64
                }]
            }, {
                "id": "other-page",
                "messaging": [{
                    "sender": { "id": "user-1" },
                    "timestamp": 1700000003000i64,
                    "message": { "mid": "mid.CCC", "text": "hi" }
                }]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn object_marker_selects_channel() {
        assert_eq!(sample().channel(), Some(ChannelType::InstagramDm));
        let page: MetaWebhookPayload =
            serde_json::from_value(serde_json::json!({"object": "page", "entry": []})).unwrap();
        assert_eq!(page.channel(), Some(ChannelType::FacebookMessenger));
        let odd: MetaWebhookPayload =
            serde_json::from_value(serde_json::json!({"object": "ad_account", "entry": []}))
                .unwrap();
        assert_eq!(odd.channel(), None);
    }

    #[test]
    fn fan_out_per_messaging_event() {
        let events = fan_out(&sample(), ChannelType::InstagramDm, "ig-main", "ig-page-1");
        // Customer message plus the echo; the event without a message
        // part and the mismatched entry are skipped.
        assert_eq!(events.len(), 2);

        assert_eq!(events[0].sender, "user-77");
        assert_eq!(events[0].external_id.as_deref(), Some("mid.AAA"));
        assert_eq!(
            events[0].received_at.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
        assert!(!events[0].metadata.contains_key("is_echo"));

        // The echo stays marked so the normalizer suppresses it.
        assert_eq!(events[1].metadata.get("is_echo"), Some(&serde_json::json!(true)));
    }
}
