//! Durable at-least-once outbox for outbound sends.
//!
//! Enqueue is idempotent on a caller-supplied key; a worker pool claims
//! due entries via row-level transitions and retries transient failures
//! with jittered exponential backoff until the attempt cap.

pub mod backoff;
pub mod store;
pub mod types;
pub mod worker;

pub use {
    backoff::{base_delay_ms, jittered_delay},
    store::{Enqueued, OutboxStore, run_migrations},
    types::{OutboxMessage, OutboxStatus},
    worker::{DispatchFn, DispatchResult, OutboxWorker},
};
