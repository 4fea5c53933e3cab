//! IMAP transport over TLS.

use std::sync::Arc;

use {
    anyhow::{Context, Result},
    async_trait::async_trait,
    futures::TryStreamExt,
    rustls_pki_types::ServerName,
    tokio::net::TcpStream,
    tokio_rustls::{TlsConnector, client::TlsStream},
    tracing::debug,
};

use crate::{
    config::MailboxConfig,
    poller::{MailId, MailboxTransport},
};

type ImapSession = async_imap::Session<TlsStream<TcpStream>>;

/// An authenticated IMAP session with the configured folder selected.
pub struct ImapTransport {
    session: ImapSession,
}

impl ImapTransport {
    /// Connect, authenticate, and select the folder.
    pub async fn connect(mailbox: &MailboxConfig) -> Result<Self> {
        let tcp = TcpStream::connect((mailbox.host.as_str(), mailbox.port))
            .await
            .with_context(|| format!("imap connect to {}:{}", mailbox.host, mailbox.port))?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(mailbox.host.clone())
            .with_context(|| format!("bad imap host name {}", mailbox.host))?;
        let tls = TlsConnector::from(Arc::new(tls_config))
            .connect(server_name, tcp)
            .await
            .context("imap tls handshake")?;

        let client = async_imap::Client::new(tls);
        let mut session = client
            .login(&mailbox.username, &mailbox.password)
            .await
            .map_err(|(e, _)| anyhow::anyhow!("imap login failed: {e}"))?;
        session
            .select(&mailbox.folder)
            .await
            .with_context(|| format!("imap select {}", mailbox.folder))?;

        debug!(host = %mailbox.host, folder = %mailbox.folder, "imap session ready");
        Ok(Self { session })
    }

    /// Log out politely; errors are ignored (the server drops us anyway).
    pub async fn close(mut self) {
        let _ = self.session.logout().await;
    }
}

#[async_trait]
impl MailboxTransport for ImapTransport {
    async fn list(&mut self, min_uid: Option<u32>) -> Result<Vec<MailId>> {
        let next = min_uid.unwrap_or(0).saturating_add(1);
        let uids = self
            .session
            .uid_search(format!("UID {next}:*"))
            .await
            .context("imap uid search")?;

        let mut ids: Vec<MailId> = uids
            .into_iter()
            .map(|uid| MailId {
                uid: Some(uid),
                uidl: uid.to_string(),
            })
            .collect();
        ids.sort_by_key(|id| id.uid);
        Ok(ids)
    }

    async fn fetch(&mut self, id: &MailId) -> Result<Vec<u8>> {
        let uid = id
            .uid
            .ok_or_else(|| anyhow::anyhow!("imap fetch needs a uid"))?;

        let messages: Vec<_> = self
            .session
            .uid_fetch(uid.to_string(), "RFC822")
            .await
            .context("imap uid fetch")?
            .try_collect()
            .await
            .context("imap fetch stream")?;

        messages
            .first()
            .and_then(|fetch| fetch.body())
            .map(<[u8]>::to_vec)
            .ok_or_else(|| anyhow::anyhow!("imap fetch returned no body for uid {uid}"))
    }
}
