//! WhatsApp Business webhook payloads and per-message fan-out.
//!
//! Signature verification and the GET handshake are the Meta-family
//! helpers in `switchboard_channels::webhook`.

use {
    serde::Deserialize,
    tracing::{debug, warn},
};

use switchboard_channels::{ChannelType, Metadata, RawInbound};
use switchboard_common::time::from_ms;

/// Top-level webhook payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: String,
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeValue {
    pub metadata: Option<ValueMetadata>,
    #[serde(default)]
    pub contacts: Vec<WaContact>,
    #[serde(default)]
    pub messages: Vec<WaMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValueMetadata {
    #[serde(default)]
    pub display_phone_number: String,
    #[serde(default)]
    pub phone_number_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaContact {
    #[serde(default)]
    pub wa_id: String,
    pub profile: Option<WaProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaProfile {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaMessage {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub id: String,
    /// Unix seconds, as a string.
    #[serde(default)]
    pub timestamp: String,
    #[serde(rename = "type", default)]
    pub message_type: String,
    pub text: Option<WaText>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaText {
    #[serde(default)]
    pub body: String,
}

impl WaMessage {
    /// Text body, when the message carries one.
    #[must_use]
    pub fn text_body(&self) -> Option<String> {
        self.text.as_ref().map(|t| t.body.clone())
    }
}

/// Fan a webhook payload out into raw inbound events, one per message.
///
/// `target_id` is the channel-target resolved from the payload's
/// phone-number id; events whose metadata names a different phone-number
/// id are skipped with a warning.
pub fn fan_out(payload: &WebhookPayload, target_id: &str, phone_number_id: &str) -> Vec<RawInbound> {
    let mut events = Vec::new();

    for entry in &payload.entry {
        for change in &entry.changes {
            if change.field != "messages" {
                debug!(field = %change.field, "ignoring non-message webhook change");
                continue;
            }

            if let Some(metadata) = &change.value.metadata
                && metadata.phone_number_id != phone_number_id
            {
                warn!(
                    expected = %phone_number_id,
                    received = %metadata.phone_number_id,
                    "phone number id mismatch, skipping change"
                );
                continue;
            }

            // Contact display names, keyed by wa_id.
            let names: std::collections::HashMap<&str, &str> = change
                .value
                .contacts
                .iter()
                .filter_map(|c| c.profile.as_ref().map(|p| (c.wa_id.as_str(), p.name.as_str())))
                .collect();

            for message in &change.value.messages {
                let Some(body) = message.text_body() else {
                    debug!(msg_type = %message.message_type, "ignoring non-text message");
                    continue;
                };

                let mut metadata = Metadata::new();
                metadata.insert(
                    "message_type".into(),
                    serde_json::Value::String(message.message_type.clone()),
                );
                if let Some(name) = names.get(message.from.as_str()) {
                    metadata.insert(
                        "sender_name".into(),
                        serde_json::Value::String((*name).to_string()),
                    );
                }

                events.push(RawInbound {
                    channel: ChannelType::Whatsapp,
                    target_id: Some(target_id.to_string()),
                    sender: message.from.clone(),
                    external_id: (!message.id.is_empty()).then(|| message.id.clone()),
                    subject: None,
                    body,
                    received_at: message
                        .timestamp
                        .parse::<i64>()
                        .ok()
                        .map(|secs| from_ms(secs * 1000)),
                    metadata,
                });
            }
        }
    }

    events
}
