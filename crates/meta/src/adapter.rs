//! Messenger / Instagram DM adapter: normalization, the 24-hour reply
//! window, and Graph API sends.

use {
    async_trait::async_trait,
    chrono::{Duration, Utc},
    serde::Deserialize,
    tracing::warn,
};

use {
    switchboard_channels::{
        ChannelAdapter, ChannelType, InboundEvent, IntegrationTarget, OutboundPayload, RawInbound,
        SendOutcome, normalize_address,
    },
    switchboard_common::{Error, Result, time::truncate_chars},
    switchboard_config::ReplyWindowPolicy,
};

const ERROR_BODY_LIMIT: usize = 300;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v21.0";

/// Per-target credentials, deserialized from the connector config.
#[derive(Debug, Clone, Deserialize)]
pub struct MetaTargetConfig {
    pub access_token: String,
    /// Page id (Messenger) or Instagram business-account id.
    pub page_id: String,
    #[serde(default)]
    pub verify_token: Option<String>,
    #[serde(default)]
    pub app_secret: Option<String>,
    /// Override for tests and proxies.
    #[serde(default)]
    pub api_base: Option<String>,
}

impl MetaTargetConfig {
    pub fn from_target(target: &IntegrationTarget) -> Result<Self> {
        serde_json::from_value(target.config.clone()).map_err(|e| {
            Error::configuration(format!("meta target {} misconfigured: {e}", target.id))
        })
    }
}

/// Adapter for one Meta messaging surface. Messenger and Instagram DM
/// share the wire format and differ only in the channel tag.
pub struct MetaAdapter {
    channel: ChannelType,
    window: Duration,
    http: reqwest::Client,
}

impl MetaAdapter {
    #[must_use]
    pub fn messenger(policy: &ReplyWindowPolicy) -> Self {
        Self::new(ChannelType::FacebookMessenger, policy)
    }

    #[must_use]
    pub fn instagram(policy: &ReplyWindowPolicy) -> Self {
        Self::new(ChannelType::InstagramDm, policy)
    }

    fn new(channel: ChannelType, policy: &ReplyWindowPolicy) -> Self {
        Self {
            channel,
            window: Duration::hours(policy.hours),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for MetaAdapter {
    fn channel(&self) -> ChannelType {
        self.channel
    }

    fn reply_window(&self) -> Option<Duration> {
        Some(self.window)
    }

    fn normalize(&self, raw: &RawInbound, target: &IntegrationTarget) -> Result<InboundEvent> {
        let sender = normalize_address(self.channel, &raw.sender);
        if sender.is_empty() {
            return Err(Error::validation("meta event has no sender id"));
        }
        if raw.body.is_empty() {
            return Err(Error::validation("meta event has no text"));
        }

        Ok(InboundEvent {
            channel: self.channel,
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
        // The page's own id shows up as the sender on echoed sends.
        target
            .outbound_addresses
            .iter()
            .any(|address| address == &event.sender)
            || target.routing_key.as_deref() == Some(event.sender.as_str())
    }

    async fn send(&self, payload: &OutboundPayload, target: &IntegrationTarget) -> SendOutcome {
        let config = match MetaTargetConfig::from_target(target) {
            Ok(config) => config,
            Err(e) => {
                return SendOutcome::Permanent {
                    error: e.to_string(),
                };
            },
        };
        if config.access_token.is_empty() {
            return SendOutcome::Permanent {
                error: format!("meta target {} has no access token", target.id),
            };
        }

        let base = config.api_base.as_deref().unwrap_or(GRAPH_API_BASE);
        let url = format!("{base}/{}/messages", config.page_id);
        let body = serde_json::json!({
            "recipient": { "id": payload.recipient },
            "messaging_type": "RESPONSE",
            "message": { "text": payload.body },
        });

        let response = match self
            .http
            .post(&url)
            .query(&[("access_token", config.access_token.as_str())])
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return SendOutcome::Transient {
                    error: format!("{} request failed: {e}", self.channel),
                };
            },
        };

        let status = response.status();
        if status.is_success() {
            let provider_id = response
                .json::<SendResponse>()
                .await
                .ok()
                .and_then(|r| r.message_id);
            return SendOutcome::Sent { provider_id };
        }

        let text = response.text().await.unwrap_or_default();
        let text = truncate_chars(&text, ERROR_BODY_LIMIT);
        warn!(
            channel = %self.channel,
            status = status.as_u16(),
            body = text,
            "meta send rejected"
        );

        match status.as_u16() {
            401 | 403 => SendOutcome::Permanent {
                error: format!("{} auth rejected ({status}): {text}", self.channel),
            },
            429 => SendOutcome::Transient {
                error: format!("{} rate limited ({status}): {text}", self.channel),
            },
            code if code >= 500 => SendOutcome::Transient {
                error: format!("{} server error ({status}): {text}", self.channel),
            },
            _ => SendOutcome::Permanent {
                error: format!("{} rejected send ({status}): {text}", self.channel),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: Option<String>,
}
