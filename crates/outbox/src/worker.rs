//! Worker loop that drains due outbox entries through the dispatcher.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use {
    anyhow::Result,
    chrono::{DateTime, Utc},
    tokio::{
        sync::{Mutex, Notify, RwLock},
        task::JoinHandle,
    },
    tracing::{debug, info, warn},
};

use {
    switchboard_channels::SendOutcome,
    switchboard_config::OutboxPolicy,
};

use crate::{backoff::jittered_delay, store::OutboxStore, types::OutboxMessage};

/// Outcome of one dispatcher invocation for an outbox entry.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub outcome: SendOutcome,
    /// Id of the Message row the dispatcher persisted for this attempt.
    pub message_id: Option<String>,
}

/// Callback invoking the outbound dispatcher for one claimed entry.
pub type DispatchFn = Arc<
    dyn Fn(OutboxMessage) -> Pin<Box<dyn Future<Output = DispatchResult> + Send>> + Send + Sync,
>;

/// Pulls due entries, claims them row-by-row, and records outcomes.
///
/// Concurrency safety comes from the claim transition and idempotency
/// keys; multiple workers over the same table never need a shared lock.
pub struct OutboxWorker {
    store: OutboxStore,
    policy: OutboxPolicy,
    dispatch: DispatchFn,
    wake: Arc<Notify>,
    running: RwLock<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OutboxWorker {
    pub fn new(store: OutboxStore, policy: OutboxPolicy, dispatch: DispatchFn) -> Arc<Self> {
        Arc::new(Self {
            store,
            policy,
            dispatch,
            wake: Arc::new(Notify::new()),
            running: RwLock::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Start the polling loop.
    pub async fn start(self: &Arc<Self>) {
        *self.running.write().await = true;
        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            worker.run_loop().await;
        });
        *self.handle.lock().await = Some(handle);
        info!("outbox worker started");
    }

    /// Stop the polling loop.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.wake.notify_one();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        info!("outbox worker stopped");
    }

    /// Nudge the loop after an enqueue instead of waiting out the poll
    /// interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    async fn run_loop(self: Arc<Self>) {
        let period = Duration::from_millis(self.policy.poll_interval_ms.max(10));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = self.wake.notified() => {},
            }
            if !*self.running.read().await {
                break;
            }
            if let Err(e) = self.run_once(Utc::now()).await {
                warn!(error = %e, "outbox pass failed");
            }
        }
    }

    /// One pass: claim and process every due entry, bounded by the worker
    /// count. Returns how many entries were claimed.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self
            .store
            .list_due(now, self.policy.worker_count.max(1) as u32)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let results =
            futures::future::join_all(due.iter().map(|entry| self.process(&entry.id, now))).await;
        Ok(results.into_iter().filter(|claimed| *claimed).count())
    }

    /// Claim and process one entry. Returns false when the claim no-ops
    /// (not due, terminal, or another worker won the row).
    pub async fn process(&self, id: &str, now: DateTime<Utc>) -> bool {
        let claimed = match self.store.claim(id, now).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(e) => {
                warn!(id, error = %e, "outbox claim failed");
                return false;
            },
        };

        let attempts = claimed.attempts;
        let entry_id = claimed.id.clone();
        let send_timeout = Duration::from_secs(self.policy.send_timeout_secs.max(1));

        // The network call runs outside any store transaction, under a
        // bounded timeout.
        let result =
            match tokio::time::timeout(send_timeout, (self.dispatch)(claimed)).await {
                Ok(result) => result,
                Err(_) => DispatchResult {
                    outcome: SendOutcome::Transient {
                        error: format!("send timed out after {}s", send_timeout.as_secs()),
                    },
                    message_id: None,
                },
            };

        let recorded = match &result.outcome {
            SendOutcome::Sent { .. } => {
                debug!(id = %entry_id, attempts, "outbox entry sent");
                self.store
                    .mark_sent(&entry_id, result.message_id.as_deref())
                    .await
            },
            SendOutcome::Permanent { error } => {
                warn!(id = %entry_id, attempts, error, "outbox entry failed permanently");
                self.store.mark_failed(&entry_id, error).await
            },
            SendOutcome::Transient { error } if attempts >= self.policy.max_attempts => {
                warn!(
                    id = %entry_id,
                    attempts,
                    error,
                    "outbox entry exhausted its attempt cap"
                );
                self.store
                    .mark_failed(&entry_id, &format!("{error} (attempts exhausted)"))
                    .await
            },
            SendOutcome::Transient { error } => {
                let delay = jittered_delay(&self.policy, attempts);
                debug!(
                    id = %entry_id,
                    attempts,
                    delay_ms = delay.num_milliseconds(),
                    error,
                    "outbox entry scheduled for retry"
                );
                self.store
                    .mark_retrying(&entry_id, now + delay, error)
                    .await
            },
        };

        if let Err(e) = recorded {
            warn!(id = %entry_id, error = %e, "failed to record outbox outcome");
        }
        true
    }
}
