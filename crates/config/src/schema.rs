//! Engine policy configuration.
//!
//! Every value here is a policy knob the routing engine treats as tunable:
//! dedup windows, backoff constants, attempt caps, poll cadence. Defaults
//! match production behavior; a `switchboard.toml` overrides per section.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    pub ingest: IngestPolicy,
    pub outbox: OutboxPolicy,
    pub mailbox: MailboxPolicy,
    pub reply_window: ReplyWindowPolicy,
}

/// Inbound normalization and dedup policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct IngestPolicy {
    /// Half-width of the fingerprint dedup window, in seconds. An id-less
    /// inbound payload is a duplicate if a matching fingerprint exists
    /// within this many seconds on either side of its timestamp.
    pub fingerprint_window_secs: i64,
    /// Provider ids longer than this are replaced with a content hash
    /// before storage.
    pub max_external_id_len: usize,
    /// How many times the inbound pipeline re-runs a failed payload before
    /// writing it to the dead-letter store.
    pub pipeline_attempts: u32,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            fingerprint_window_secs: 300,
            max_external_id_len: 120,
            pipeline_attempts: 3,
        }
    }
}

/// Outbox retry and worker policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct OutboxPolicy {
    /// First retry delay; doubles on every subsequent attempt.
    pub base_backoff_ms: u64,
    /// Ceiling for the computed backoff, before jitter.
    pub max_backoff_ms: u64,
    /// Up to this fraction of the delay is added as random jitter.
    pub jitter_ratio: f64,
    /// Attempts before an item becomes terminally failed.
    pub max_attempts: u32,
    /// Concurrent sends per worker pass.
    pub worker_count: usize,
    /// How often the worker scans for due items.
    pub poll_interval_ms: u64,
    /// Bounded timeout applied to every provider network call.
    pub send_timeout_secs: u64,
}

impl Default for OutboxPolicy {
    fn default() -> Self {
        Self {
            base_backoff_ms: 2_000,
            max_backoff_ms: 300_000,
            jitter_ratio: 0.25,
            max_attempts: 8,
            worker_count: 4,
            poll_interval_ms: 1_000,
            send_timeout_secs: 30,
        }
    }
}

/// Mailbox polling policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct MailboxPolicy {
    /// Seconds between poll cycles per mailbox.
    pub poll_interval_secs: u64,
    /// Max messages pulled per cycle.
    pub batch_limit: usize,
    /// How many recently-seen POP3 UIDLs to remember. POP3 UIDLs are not
    /// guaranteed ordered, so a plain high-water mark would skip mail.
    pub uidl_history_limit: usize,
}

impl Default for MailboxPolicy {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            batch_limit: 50,
            uidl_history_limit: 200,
        }
    }
}

/// Meta customer-initiated messaging window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct ReplyWindowPolicy {
    /// Hours after the last inbound message during which Messenger and
    /// Instagram sends are allowed.
    pub hours: i64,
}

impl Default for ReplyWindowPolicy {
    fn default() -> Self {
        Self { hours: 24 }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.ingest.fingerprint_window_secs, 300);
        assert_eq!(cfg.ingest.max_external_id_len, 120);
        assert_eq!(cfg.outbox.max_attempts, 8);
        assert_eq!(cfg.reply_window.hours, 24);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            [outbox]
            max_attempts = 3
            base_backoff_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.outbox.max_attempts, 3);
        assert_eq!(cfg.outbox.base_backoff_ms, 500);
        // Untouched sections keep defaults.
        assert_eq!(cfg.outbox.max_backoff_ms, 300_000);
        assert_eq!(cfg.mailbox.poll_interval_secs, 60);
    }

    #[test]
    fn roundtrip() {
        let cfg = EngineConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(cfg, back);
    }
}
