//! Inbound ingestion: normalization, dedup, self-send suppression,
//! conversation resolution, and dead-letter capture.
//!
//! Raw provider payloads enter through [`InboundPipeline::ingest`];
//! duplicates and self-sends come back as typed no-op outcomes so webhook
//! handlers and pollers stay idempotent.

pub mod dedup;
pub mod normalize;
pub mod pipeline;
pub mod resolver;

pub use {
    dedup::DedupEngine,
    normalize::{has_echo_marker, normalize_external_id},
    pipeline::{InboundPipeline, IngestOutcome, Suppression},
    resolver::{ConversationResolver, ResolutionCache, ResolutionSource, ResolvedConversation},
};
