//! Email channel adapter: normalization, self-send detection, SMTP
//! delivery with transport fallback.

use {
    async_trait::async_trait,
    chrono::Utc,
    lettre::{
        AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
        message::{Mailbox, MessageBuilder},
        transport::smtp::authentication::Credentials,
    },
    tracing::{debug, warn},
};

use {
    switchboard_channels::{
        ChannelAdapter, ChannelType, DedupScope, InboundEvent, IntegrationTarget, OutboundPayload,
        RawInbound, SendOutcome, normalize_address,
    },
    switchboard_common::{Error, Result},
};

use crate::config::{EmailTargetConfig, SmtpConfig};

/// Email adapter over SMTP.
pub struct EmailAdapter;

impl Default for EmailAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn build_message(
        payload: &OutboundPayload,
        from_address: &str,
    ) -> Result<lettre::Message> {
        let from: Mailbox = from_address
            .parse()
            .map_err(|e| Error::configuration(format!("bad from address {from_address}: {e}")))?;
        let to: Mailbox = payload
            .recipient
            .parse()
            .map_err(|e| Error::validation(format!("undeliverable recipient: {e}")))?;

        let mut builder = MessageBuilder::new()
            .from(from)
            .to(to)
            .subject(payload.subject.clone().unwrap_or_default());
        if let Some(parent) = &payload.in_reply_to {
            builder = builder
                .in_reply_to(format!("<{parent}>"))
                .references(format!("<{parent}>"));
        }

        builder
            .body(payload.body.clone())
            .map_err(|e| Error::validation(format!("could not build message: {e}")))
    }

    fn transport(smtp: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
            .map_err(|e| Error::configuration(format!("bad smtp relay {}: {e}", smtp.host)))?
            .port(smtp.port);
        if let (Some(username), Some(password)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        Ok(builder.build())
    }

    async fn send_via(
        smtp: &SmtpConfig,
        message: &lettre::Message,
    ) -> std::result::Result<(), String> {
        let transport = Self::transport(smtp).map_err(|e| e.to_string())?;
        transport
            .send(message.clone())
            .await
            .map(|_| ())
            .map_err(|e| format!("smtp {}: {e}", smtp.host))
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> ChannelType {
        ChannelType::Email
    }

    /// Polling and direct SMTP receipt can observe the same message via
    /// different mailboxes, so email dedups across targets.
    fn dedup_scope(&self) -> DedupScope {
        DedupScope::CrossTarget
    }

    fn normalize(&self, raw: &RawInbound, target: &IntegrationTarget) -> Result<InboundEvent> {
        let sender = normalize_address(ChannelType::Email, &raw.sender);
        if !sender.contains('@') {
            return Err(Error::validation(format!("bad email sender: {sender}")));
        }

        Ok(InboundEvent {
            channel: ChannelType::Email,
            target_id: raw
                .target_id
                .clone()
                .unwrap_or_else(|| target.id.clone()),
            sender,
            external_id: raw.external_id.clone(),
            subject: raw.subject.clone(),
            body: raw.body.clone(),
            received_at: raw.received_at.unwrap_or_else(Utc::now),
            metadata: raw.metadata.clone(),
        })
    }

    fn is_self_sent(&self, event: &InboundEvent, target: &IntegrationTarget) -> bool {
        if target
            .outbound_addresses
            .iter()
            .any(|address| normalize_address(ChannelType::Email, address) == event.sender)
        {
            return true;
        }
        EmailTargetConfig::from_target(target)
            .map(|config| {
                normalize_address(ChannelType::Email, &config.from_address) == event.sender
            })
            .unwrap_or(false)
    }

    async fn send(&self, payload: &OutboundPayload, target: &IntegrationTarget) -> SendOutcome {
        let config = match EmailTargetConfig::from_target(target) {
            Ok(config) => config,
            Err(e) => {
                return SendOutcome::Permanent {
                    error: e.to_string(),
                };
            },
        };

        let message = match Self::build_message(payload, &config.from_address) {
            Ok(message) => message,
            Err(e) => {
                // Undeliverable address, malformed content: retrying
                // cannot help.
                return SendOutcome::Permanent {
                    error: e.to_string(),
                };
            },
        };

        // Primary configured transport first, default transport second.
        let transports: Vec<&SmtpConfig> = config
            .smtp
            .iter()
            .chain(config.fallback_smtp.iter())
            .collect();
        if transports.is_empty() {
            return SendOutcome::Permanent {
                error: format!("email target {} has no smtp transport", target.id),
            };
        }

        let mut last_error = String::new();
        for smtp in transports {
            match Self::send_via(smtp, &message).await {
                Ok(()) => {
                    debug!(host = %smtp.host, to = %payload.recipient, "email accepted by relay");
                    // SMTP has no provider message id; threading uses the
                    // Message-ID we generated.
                    return SendOutcome::Sent { provider_id: None };
                },
                Err(e) => {
                    warn!(host = %smtp.host, error = %e, "smtp transport failed, trying next");
                    last_error = e;
                },
            }
        }

        SendOutcome::Transient { error: last_error }
    }
}
