//! Mailbox polling: turn a mailbox into a stream of inbound payloads.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use {
    anyhow::Result,
    async_trait::async_trait,
    tokio::{
        sync::{Mutex, RwLock},
        task::JoinHandle,
    },
    tracing::{debug, info, warn},
};

use {
    switchboard_channels::{
        AttachmentStore, ChannelType, InboundSink, IntegrationTarget, Metadata, RawInbound,
    },
    switchboard_config::MailboxPolicy,
};

use crate::{
    config::MailboxProtocol,
    cursor::{CursorStore, MailboxCursor},
    mime::{ParsedEmail, parse_email},
};

/// Identifier of one message in a mailbox listing.
///
/// IMAP fills `uid`; POP3 fills `uid` with the session-scoped message
/// number and `uidl` with the stable UIDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailId {
    pub uid: Option<u32>,
    pub uidl: String,
}

/// Protocol seam the poller drives. Implemented over IMAP and POP3; tests
/// use an in-memory mailbox.
#[async_trait]
pub trait MailboxTransport: Send {
    /// List message ids. `min_uid` lets IMAP narrow the listing to UIDs
    /// above the cursor; POP3 ignores it and lists everything.
    async fn list(&mut self, min_uid: Option<u32>) -> Result<Vec<MailId>>;

    /// Fetch one raw RFC 822 message.
    async fn fetch(&mut self, id: &MailId) -> Result<Vec<u8>>;
}

/// Counters from one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// New messages the listing produced past the cursor.
    pub listed: usize,
    /// Messages fed into the inbound pipeline.
    pub ingested: usize,
}

/// Polls one configured mailbox and feeds the inbound pipeline.
pub struct MailboxPoller {
    target: IntegrationTarget,
    protocol: MailboxProtocol,
    sink: Arc<dyn InboundSink>,
    attachments: Arc<dyn AttachmentStore>,
    cursors: Arc<dyn CursorStore>,
    policy: MailboxPolicy,
}

impl MailboxPoller {
    #[must_use]
    pub fn new(
        target: IntegrationTarget,
        protocol: MailboxProtocol,
        sink: Arc<dyn InboundSink>,
        attachments: Arc<dyn AttachmentStore>,
        cursors: Arc<dyn CursorStore>,
        policy: MailboxPolicy,
    ) -> Self {
        Self {
            target,
            protocol,
            sink,
            attachments,
            cursors,
            policy,
        }
    }

    /// Run one poll cycle over an open transport.
    ///
    /// The cursor advances only past messages the pipeline durably
    /// processed; a failure mid-batch persists the prefix and returns the
    /// error, so the next cycle re-fetches the remainder.
    pub async fn poll_once(&self, transport: &mut dyn MailboxTransport) -> Result<PollStats> {
        match self.protocol {
            MailboxProtocol::Imap => self.poll_imap(transport).await,
            MailboxProtocol::Pop3 => self.poll_pop3(transport).await,
        }
    }

    async fn poll_imap(&self, transport: &mut dyn MailboxTransport) -> Result<PollStats> {
        let mut last_uid = match self.cursors.load(&self.target.id).await? {
            Some(MailboxCursor::Imap { last_uid }) => last_uid,
            _ => 0,
        };
        let start_uid = last_uid;

        let mut ids: Vec<MailId> = transport
            .list(Some(last_uid))
            .await?
            .into_iter()
            .filter(|id| id.uid.is_some_and(|uid| uid > last_uid))
            .collect();
        ids.sort_by_key(|id| id.uid);
        ids.truncate(self.policy.batch_limit);

        let mut stats = PollStats {
            listed: ids.len(),
            ..PollStats::default()
        };

        for id in &ids {
            let outcome = self.process_one(transport, id).await;
            match outcome {
                Ok(ingested) => {
                    if ingested {
                        stats.ingested += 1;
                    }
                    if let Some(uid) = id.uid {
                        last_uid = last_uid.max(uid);
                    }
                },
                Err(e) => {
                    // Persist the processed prefix; the rest re-runs next
                    // cycle.
                    if last_uid != start_uid {
                        self.cursors
                            .save(&self.target.id, &MailboxCursor::Imap { last_uid })
                            .await?;
                    }
                    return Err(e);
                },
            }
        }

        if last_uid != start_uid {
            self.cursors
                .save(&self.target.id, &MailboxCursor::Imap { last_uid })
                .await?;
        }
        debug!(target_id = %self.target.id, ?stats, last_uid, "imap poll cycle complete");
        Ok(stats)
    }

    async fn poll_pop3(&self, transport: &mut dyn MailboxTransport) -> Result<PollStats> {
        let mut recent = match self.cursors.load(&self.target.id).await? {
            Some(MailboxCursor::Pop3 { recent_uidls }) => recent_uidls,
            _ => Vec::new(),
        };
        let seen_before = recent.len();

        let mut new_ids: Vec<MailId> = transport
            .list(None)
            .await?
            .into_iter()
            .filter(|id| !recent.contains(&id.uidl))
            .collect();
        new_ids.truncate(self.policy.batch_limit);

        let mut stats = PollStats {
            listed: new_ids.len(),
            ..PollStats::default()
        };

        for id in &new_ids {
            match self.process_one(transport, id).await {
                Ok(ingested) => {
                    if ingested {
                        stats.ingested += 1;
                    }
                    recent.push(id.uidl.clone());
                },
                Err(e) => {
                    if recent.len() != seen_before {
                        self.save_pop3_cursor(recent).await?;
                    }
                    return Err(e);
                },
            }
        }

        if recent.len() != seen_before {
            self.save_pop3_cursor(recent).await?;
        }
        debug!(target_id = %self.target.id, ?stats, "pop3 poll cycle complete");
        Ok(stats)
    }

    async fn save_pop3_cursor(&self, mut recent: Vec<String>) -> Result<()> {
        // Bounded history: POP3 UIDLs are not ordered, so remember the
        // most recent N instead of a high-water mark.
        if recent.len() > self.policy.uidl_history_limit {
            let drop = recent.len() - self.policy.uidl_history_limit;
            recent.drain(..drop);
        }
        self.cursors
            .save(
                &self.target.id,
                &MailboxCursor::Pop3 {
                    recent_uidls: recent,
                },
            )
            .await
    }

    /// Fetch, parse, and hand one message to the pipeline.
    ///
    /// Returns Ok(false) for mail skipped locally (no usable sender);
    /// those still advance the cursor.
    async fn process_one(
        &self,
        transport: &mut dyn MailboxTransport,
        id: &MailId,
    ) -> Result<bool> {
        let raw_bytes = transport.fetch(id).await?;
        let parsed = match parse_email(&raw_bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(target_id = %self.target.id, uidl = %id.uidl, error = %e, "skipping unparseable mail");
                return Ok(false);
            },
        };
        let Some(from) = parsed.from.clone() else {
            warn!(target_id = %self.target.id, uidl = %id.uidl, "skipping mail without a sender");
            return Ok(false);
        };

        let raw = self.to_raw_inbound(from, parsed).await?;
        self.sink
            .dispatch_inbound(raw)
            .await
            .map_err(|e| anyhow::anyhow!("inbound pipeline rejected mail {}: {e}", id.uidl))?;
        Ok(true)
    }

    async fn to_raw_inbound(&self, from: String, parsed: ParsedEmail) -> Result<RawInbound> {
        let mut metadata = Metadata::new();
        if !parsed.in_reply_to.is_empty() {
            metadata.insert("in_reply_to".into(), serde_json::json!(parsed.in_reply_to));
        }
        if !parsed.references.is_empty() {
            metadata.insert("references".into(), serde_json::json!(parsed.references));
        }
        if !parsed.to.is_empty() {
            metadata.insert("to".into(), serde_json::json!(parsed.to));
        }
        if !parsed.cc.is_empty() {
            metadata.insert("cc".into(), serde_json::json!(parsed.cc));
        }
        if !parsed.reply_to.is_empty() {
            metadata.insert("reply_to".into(), serde_json::json!(parsed.reply_to));
        }

        // Attachments become content-addressed blobs in the external
        // store; messages only carry the references.
        let mut refs = Vec::new();
        for attachment in parsed.attachments {
            let stored = self
                .attachments
                .store(
                    &attachment.filename,
                    &attachment.content_type,
                    attachment.bytes,
                )
                .await
                .map_err(|e| anyhow::anyhow!("attachment store failed: {e}"))?;
            refs.push(stored);
        }
        if !refs.is_empty() {
            metadata.insert("attachments".into(), serde_json::json!(refs));
        }

        Ok(RawInbound {
            channel: ChannelType::Email,
            target_id: Some(self.target.id.clone()),
            sender: from,
            external_id: parsed.message_id,
            subject: parsed.subject,
            body: parsed.body,
            received_at: parsed.date,
            metadata,
        })
    }
}

/// Factory reconnecting a transport for each poll cycle.
pub type TransportConnectFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<Box<dyn MailboxTransport>>> + Send>>
        + Send
        + Sync,
>;

/// Scheduled polling of one mailbox.
pub struct MailboxPollWorker {
    poller: Arc<MailboxPoller>,
    connect: TransportConnectFn,
    interval_secs: u64,
    running: RwLock<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MailboxPollWorker {
    pub fn new(
        poller: Arc<MailboxPoller>,
        connect: TransportConnectFn,
        interval_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            poller,
            connect,
            interval_secs,
            running: RwLock::new(false),
            handle: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        *self.running.write().await = true;
        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            worker.run_loop().await;
        });
        *self.handle.lock().await = Some(handle);
        info!(interval_secs = self.interval_secs, "mailbox poll worker started");
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        info!("mailbox poll worker stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if !*self.running.read().await {
                break;
            }
            match (self.connect)().await {
                Ok(mut transport) => {
                    if let Err(e) = self.poller.poll_once(transport.as_mut()).await {
                        warn!(error = %e, "mailbox poll cycle failed");
                    }
                },
                Err(e) => warn!(error = %e, "mailbox connection failed"),
            }
        }
    }
}
