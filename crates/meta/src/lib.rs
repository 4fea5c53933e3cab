//! Meta messaging channels (Facebook Messenger, Instagram DM): webhook
//! fan-out, the customer-initiated reply window, and Graph API delivery.

pub mod adapter;
pub mod webhook;

pub use {
    adapter::{MetaAdapter, MetaTargetConfig},
    webhook::{MetaWebhookPayload, fan_out},
};
