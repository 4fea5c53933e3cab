//! WhatsApp Business channel: webhook intake and Graph API delivery.

pub mod adapter;
pub mod webhook;

pub use {
    adapter::{WhatsAppAdapter, WhatsAppTargetConfig},
    switchboard_channels::webhook::{verify_signature, verify_subscription},
    webhook::{WebhookPayload, fan_out},
};
