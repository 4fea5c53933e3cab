//! WhatsApp channel adapter: normalization and Graph API sends.

use {async_trait::async_trait, chrono::Utc, serde::Deserialize, tracing::warn};

use {
    switchboard_channels::{
        ChannelAdapter, ChannelType, InboundEvent, IntegrationTarget, OutboundPayload, RawInbound,
        SendOutcome, normalize_address,
    },
    switchboard_common::{Error, Result, time::truncate_chars},
};

/// How much of a provider error body is kept in stored errors.
const ERROR_BODY_LIMIT: usize = 300;

/// Default Graph API root.
const GRAPH_API_BASE: &str = "https://graph.facebook.com/v21.0";

/// Per-target credentials, deserialized from the connector config.
#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppTargetConfig {
    pub access_token: String,
    pub phone_number_id: String,
    /// Webhook GET-handshake token.
    #[serde(default)]
    pub verify_token: Option<String>,
    /// App secret for `X-Hub-Signature-256` verification.
    #[serde(default)]
    pub app_secret: Option<String>,
    /// Override for tests and proxies.
    #[serde(default)]
    pub api_base: Option<String>,
}

impl WhatsAppTargetConfig {
    pub fn from_target(target: &IntegrationTarget) -> Result<Self> {
        serde_json::from_value(target.config.clone()).map_err(|e| {
            Error::configuration(format!("whatsapp target {} misconfigured: {e}", target.id))
        })
    }
}

/// WhatsApp Business adapter over the Graph API.
pub struct WhatsAppAdapter {
    http: reqwest::Client,
}

impl Default for WhatsAppAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl WhatsAppAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for WhatsAppAdapter {
    fn channel(&self) -> ChannelType {
        ChannelType::Whatsapp
    }

    fn normalize(&self, raw: &RawInbound, target: &IntegrationTarget) -> Result<InboundEvent> {
        let sender = normalize_address(ChannelType::Whatsapp, &raw.sender);
        if sender.is_empty() {
            return Err(Error::validation("whatsapp sender has no digits"));
        }
        if raw.body.trim().is_empty() {
            return Err(Error::validation("whatsapp message has no text body"));
        }

        Ok(InboundEvent {
            channel: ChannelType::Whatsapp,
            target_id: raw
                .target_id
                .clone()
                .unwrap_or_else(|| target.id.clone()),
            sender,
            external_id: raw.external_id.clone(),
            subject: None,
            body: raw.body.clone(),
            received_at: raw.received_at.unwrap_or_else(Utc::now),
            metadata: raw.metadata.clone(),
        })
    }

    fn is_self_sent(&self, event: &InboundEvent, target: &IntegrationTarget) -> bool {
        target
            .outbound_addresses
            .iter()
            .any(|address| normalize_address(ChannelType::Whatsapp, address) == event.sender)
    }

    async fn send(&self, payload: &OutboundPayload, target: &IntegrationTarget) -> SendOutcome {
        let config = match WhatsAppTargetConfig::from_target(target) {
            Ok(config) => config,
            Err(e) => {
                return SendOutcome::Permanent {
                    error: e.to_string(),
                };
            },
        };
        if config.access_token.is_empty() || config.phone_number_id.is_empty() {
            return SendOutcome::Permanent {
                error: format!(
                    "whatsapp target {} has no access token or phone number id",
                    target.id
                ),
            };
        }

        let base = config.api_base.as_deref().unwrap_or(GRAPH_API_BASE);
        let url = format!("{base}/{}/messages", config.phone_number_id);
        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": payload.recipient,
            "type": "text",
            "text": { "body": payload.body },
        });

        let response = match self
            .http
            .post(&url)
            .bearer_auth(&config.access_token)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return SendOutcome::Transient {
                    error: format!("whatsapp request failed: {e}"),
                };
            },
        };

        let status = response.status();
        if status.is_success() {
            let provider_id = response
                .json::<SendResponse>()
                .await
                .ok()
                .and_then(|r| r.messages.into_iter().next())
                .map(|m| m.id);
            return SendOutcome::Sent { provider_id };
        }

        let text = response.text().await.unwrap_or_default();
        let text = truncate_chars(&text, ERROR_BODY_LIMIT);
        warn!(status = status.as_u16(), body = text, "whatsapp send rejected");

        // 401/403 is an operator problem (dead token), not a recipient
        // problem; name it explicitly in the stored error.
        match status.as_u16() {
            401 | 403 => SendOutcome::Permanent {
                error: format!("whatsapp auth rejected ({status}): {text}"),
            },
            429 => SendOutcome::Transient {
                error: format!("whatsapp rate limited ({status}): {text}"),
            },
            code if code >= 500 => SendOutcome::Transient {
                error: format!("whatsapp server error ({status}): {text}"),
            },
            _ => SendOutcome::Permanent {
                error: format!("whatsapp rejected send ({status}): {text}"),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}
