//! Engine policy configuration: dedup windows, backoff constants, attempt
//! caps, poll cadence. Loaded from `switchboard.toml` with `${ENV_VAR}`
//! substitution; every section defaults sensibly when absent.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{discover_and_load, load_config},
    schema::{EngineConfig, IngestPolicy, MailboxPolicy, OutboxPolicy, ReplyWindowPolicy},
};
