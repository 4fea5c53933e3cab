//! Email target configuration, deserialized from the connector config.

use serde::{Deserialize, Serialize};

use {
    switchboard_channels::IntegrationTarget,
    switchboard_common::{Error, Result},
};

/// One SMTP relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

/// Which protocol the mailbox is pulled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailboxProtocol {
    Imap,
    Pop3,
}

/// A pollable mailbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailboxConfig {
    pub protocol: MailboxProtocol,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// IMAP folder; ignored for POP3.
    #[serde(default = "default_folder")]
    pub folder: String,
}

fn default_folder() -> String {
    "INBOX".into()
}

/// Per-target email configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailTargetConfig {
    /// Address outbound mail is sent from on this target.
    pub from_address: String,
    /// Primary transport, attempted first.
    pub smtp: Option<SmtpConfig>,
    /// Default transport, used when the primary is absent or fails.
    #[serde(default)]
    pub fallback_smtp: Option<SmtpConfig>,
    /// Mailbox to poll for inbound mail.
    #[serde(default)]
    pub mailbox: Option<MailboxConfig>,
}

impl EmailTargetConfig {
    pub fn from_target(target: &IntegrationTarget) -> Result<Self> {
        serde_json::from_value(target.config.clone()).map_err(|e| {
            Error::configuration(format!("email target {} misconfigured: {e}", target.id))
        })
    }
}
