//! Channel-target resolution: which credential/account serves a given
//! channel and routing key.

use {async_trait::async_trait, serde::Serialize};

use switchboard_common::{Error, Result};

use crate::types::ChannelType;

/// A configured credential/routing scope for one channel: a specific
/// mailbox, a specific WhatsApp number, a specific Meta page.
///
/// Owned by the external configuration subsystem; read-only here. The
/// channel-specific credential shape lives in `config` and is
/// deserialized by the owning adapter.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationTarget {
    pub id: String,
    pub channel: ChannelType,
    pub name: String,
    /// Addresses this target sends from, normalized. Inbound payloads
    /// whose sender matches one of these are suppressed as self-sends.
    pub outbound_addresses: Vec<String>,
    /// Provider-side routing key attached to inbound traffic: WhatsApp
    /// phone-number id, Meta page id, mailbox address.
    pub routing_key: Option<String>,
    /// Whether this target serves its channel when no explicit target is
    /// requested. At most one default per channel.
    pub is_default: bool,
    pub config: serde_json::Value,
}

/// Read-only store of configured targets.
#[async_trait]
pub trait ConnectorStore: Send + Sync {
    async fn list(&self, channel: ChannelType) -> Result<Vec<IntegrationTarget>>;
    async fn get(&self, channel: ChannelType, id: &str) -> Result<Option<IntegrationTarget>>;
}

/// Resolves which target serves a given channel + logical routing key.
pub struct ConnectorRegistry {
    store: std::sync::Arc<dyn ConnectorStore>,
}

impl ConnectorRegistry {
    #[must_use]
    pub fn new(store: std::sync::Arc<dyn ConnectorStore>) -> Self {
        Self { store }
    }

    /// Resolve the target for an outbound send or a normalization pass.
    ///
    /// An explicit target id wins; otherwise the channel's default target
    /// is used. A channel with no usable target is a configuration error.
    pub async fn resolve(
        &self,
        channel: ChannelType,
        explicit_id: Option<&str>,
    ) -> Result<IntegrationTarget> {
        if let Some(id) = explicit_id {
            return self
                .store
                .get(channel, id)
                .await?
                .ok_or_else(|| Error::not_found("channel target", id));
        }

        let targets = self.store.list(channel).await?;
        targets
            .iter()
            .find(|t| t.is_default)
            .or_else(|| targets.first())
            .cloned()
            .ok_or_else(|| Error::configuration(format!("no target configured for {channel}")))
    }

    /// Resolve the target that owns a provider routing key, for webhook
    /// fan-in (page id, phone-number id, mailbox address).
    pub async fn resolve_by_routing_key(
        &self,
        channel: ChannelType,
        routing_key: &str,
    ) -> Result<IntegrationTarget> {
        let targets = self.store.list(channel).await?;
        targets
            .into_iter()
            .find(|t| t.routing_key.as_deref() == Some(routing_key))
            .ok_or_else(|| Error::not_found("channel target", routing_key))
    }
}

/// In-memory connector store for tests and embedding.
#[derive(Default)]
pub struct InMemoryConnectorStore {
    targets: Vec<IntegrationTarget>,
}

impl InMemoryConnectorStore {
    #[must_use]
    pub fn new(targets: Vec<IntegrationTarget>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl ConnectorStore for InMemoryConnectorStore {
    async fn list(&self, channel: ChannelType) -> Result<Vec<IntegrationTarget>> {
        Ok(self
            .targets
            .iter()
            .filter(|t| t.channel == channel)
            .cloned()
            .collect())
    }

    async fn get(&self, channel: ChannelType, id: &str) -> Result<Option<IntegrationTarget>> {
        Ok(self
            .targets
            .iter()
            .find(|t| t.channel == channel && t.id == id)
            .cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn target(id: &str, channel: ChannelType, is_default: bool) -> IntegrationTarget {
        IntegrationTarget {
            id: id.into(),
            channel,
            name: format!("target {id}"),
            outbound_addresses: vec![],
            routing_key: Some(format!("rk-{id}")),
            is_default,
            config: serde_json::json!({}),
        }
    }

    fn registry(targets: Vec<IntegrationTarget>) -> ConnectorRegistry {
        ConnectorRegistry::new(Arc::new(InMemoryConnectorStore::new(targets)))
    }

    #[tokio::test]
    async fn explicit_id_wins_over_default() {
        let reg = registry(vec![
            target("a", ChannelType::Whatsapp, true),
            target("b", ChannelType::Whatsapp, false),
        ]);

        let t = reg.resolve(ChannelType::Whatsapp, Some("b")).await.unwrap();
        assert_eq!(t.id, "b");
    }

    #[tokio::test]
    async fn falls_back_to_default_target() {
        let reg = registry(vec![
            target("a", ChannelType::Email, false),
            target("b", ChannelType::Email, true),
        ]);

        let t = reg.resolve(ChannelType::Email, None).await.unwrap();
        assert_eq!(t.id, "b");
    }

    #[tokio::test]
    async fn unconfigured_channel_is_configuration_error() {
        let reg = registry(vec![]);
        let err = reg.resolve(ChannelType::Whatsapp, None).await.unwrap_err();
        assert!(matches!(
            err,
            switchboard_common::Error::Configuration { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_explicit_id_is_not_found() {
        let reg = registry(vec![target("a", ChannelType::Email, true)]);
        let err = reg
            .resolve(ChannelType::Email, Some("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, switchboard_common::Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn routing_key_lookup() {
        let reg = registry(vec![
            target("a", ChannelType::FacebookMessenger, true),
            target("b", ChannelType::FacebookMessenger, false),
        ]);

        let t = reg
            .resolve_by_routing_key(ChannelType::FacebookMessenger, "rk-b")
            .await
            .unwrap();
        assert_eq!(t.id, "b");
    }
}
