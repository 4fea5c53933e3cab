//! Minimal POP3 client.
//!
//! No maintained async POP3 crate exists, so this is a small line-protocol
//! client over the same TLS stack the IMAP transport uses. Only the
//! commands the poller needs: USER/PASS, UIDL, RETR, QUIT.

use std::sync::Arc;

use {
    anyhow::{Context, Result, bail},
    async_trait::async_trait,
    rustls_pki_types::ServerName,
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream},
        net::TcpStream,
    },
    tokio_rustls::{TlsConnector, client::TlsStream},
    tracing::debug,
};

use crate::{
    config::MailboxConfig,
    poller::{MailId, MailboxTransport},
};

/// POP3 session over any byte stream; generic so protocol logic is
/// testable against an in-memory duplex.
pub struct Pop3Transport<S> {
    stream: BufStream<S>,
}

impl Pop3Transport<TlsStream<TcpStream>> {
    /// Connect over TLS, read the greeting, authenticate.
    pub async fn connect(mailbox: &MailboxConfig) -> Result<Self> {
        let tcp = TcpStream::connect((mailbox.host.as_str(), mailbox.port))
            .await
            .with_context(|| format!("pop3 connect to {}:{}", mailbox.host, mailbox.port))?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(mailbox.host.clone())
            .with_context(|| format!("bad pop3 host name {}", mailbox.host))?;
        let tls = TlsConnector::from(Arc::new(tls_config))
            .connect(server_name, tcp)
            .await
            .context("pop3 tls handshake")?;

        Self::handshake(tls, &mailbox.username, &mailbox.password).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Pop3Transport<S> {
    /// Run greeting + USER/PASS over an established stream.
    pub async fn handshake(stream: S, username: &str, password: &str) -> Result<Self> {
        let mut transport = Self {
            stream: BufStream::new(stream),
        };
        transport.expect_ok().await.context("pop3 greeting")?;
        transport
            .command(&format!("USER {username}"))
            .await
            .context("pop3 USER")?;
        transport
            .command(&format!("PASS {password}"))
            .await
            .context("pop3 PASS")?;
        debug!("pop3 session ready");
        Ok(transport)
    }

    /// Send QUIT and drop the connection.
    pub async fn quit(mut self) -> Result<()> {
        self.command("QUIT").await?;
        Ok(())
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await?;
        if n == 0 {
            bail!("pop3 server closed the connection");
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Send a command and require an `+OK` status line.
    async fn command(&mut self, line: &str) -> Result<String> {
        self.send_line(line).await?;
        self.expect_ok().await
    }

    async fn expect_ok(&mut self) -> Result<String> {
        let line = self.read_line().await?;
        if let Some(rest) = line.strip_prefix("+OK") {
            Ok(rest.trim().to_string())
        } else {
            bail!("pop3 error response: {line}");
        }
    }

    /// Read a multi-line response body up to the terminating `.`,
    /// reversing dot-stuffing.
    async fn read_multiline(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "." {
                return Ok(lines);
            }
            let line = line.strip_prefix('.').map(String::from).unwrap_or(line);
            lines.push(line);
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> MailboxTransport for Pop3Transport<S> {
    async fn list(&mut self, _min_uid: Option<u32>) -> Result<Vec<MailId>> {
        self.command("UIDL").await?;
        let lines = self.read_multiline().await?;

        let mut ids = Vec::with_capacity(lines.len());
        for line in lines {
            let mut parts = line.split_whitespace();
            let (Some(number), Some(uidl)) = (parts.next(), parts.next()) else {
                bail!("malformed UIDL line: {line}");
            };
            let number: u32 = number
                .parse()
                .with_context(|| format!("bad message number in UIDL line: {line}"))?;
            ids.push(MailId {
                uid: Some(number),
                uidl: uidl.to_string(),
            });
        }
        Ok(ids)
    }

    async fn fetch(&mut self, id: &MailId) -> Result<Vec<u8>> {
        let number = id
            .uid
            .ok_or_else(|| anyhow::anyhow!("pop3 fetch needs a message number"))?;
        self.command(&format!("RETR {number}")).await?;
        let lines = self.read_multiline().await?;
        Ok(lines.join("\r\n").into_bytes())
    }
}
