//! Email channel: SMTP delivery with transport fallback, MIME parsing,
//! and IMAP/POP3 mailbox polling with durable cursors.

pub mod adapter;
pub mod config;
pub mod cursor;
pub mod imap;
pub mod mime;
pub mod poller;
pub mod pop3;

pub use {
    adapter::EmailAdapter,
    config::{EmailTargetConfig, MailboxConfig, MailboxProtocol, SmtpConfig},
    cursor::{CursorStore, InMemoryCursorStore, MailboxCursor, SqliteCursorStore},
    imap::ImapTransport,
    mime::{ParsedEmail, parse_email},
    poller::{MailId, MailboxPollWorker, MailboxPoller, MailboxTransport, PollStats},
    pop3::Pop3Transport,
};
