//! MIME parsing: headers, bodies, attachments.

use {
    chrono::{DateTime, Utc},
    mail_parser::{HeaderValue, MessageParser},
};

use switchboard_common::{Error, Result, time::from_ms};

/// An attachment lifted out of a MIME part.
#[derive(Debug, Clone)]
pub struct ParsedAttachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// The pieces of an email the inbound pipeline cares about.
#[derive(Debug, Clone, Default)]
pub struct ParsedEmail {
    pub message_id: Option<String>,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub reply_to: Vec<String>,
    pub subject: Option<String>,
    /// text/plain preferred, HTML-derived text as the fallback.
    pub body: String,
    pub date: Option<DateTime<Utc>>,
    pub attachments: Vec<ParsedAttachment>,
}

/// Parse a raw RFC 822 message.
pub fn parse_email(raw: &[u8]) -> Result<ParsedEmail> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| Error::validation("unparseable mime message"))?;

    let body = match message.body_text(0) {
        Some(text) if !text.trim().is_empty() => text.to_string(),
        _ => message
            .body_html(0)
            .map(|html| html_to_text(&html))
            .unwrap_or_default(),
    };

    let mut attachments = Vec::new();
    for part in message.attachments() {
        let filename = part
            .attachment_name()
            .unwrap_or("attachment.bin")
            .to_string();
        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(subtype) => format!("{}/{subtype}", ct.c_type),
                None => ct.c_type.to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        attachments.push(ParsedAttachment {
            filename,
            content_type,
            bytes: part.contents().to_vec(),
        });
    }

    Ok(ParsedEmail {
        message_id: message.message_id().map(String::from),
        in_reply_to: header_ids(&message, "In-Reply-To"),
        references: header_ids(&message, "References"),
        from: message
            .from()
            .and_then(|a| a.first())
            .and_then(|a| a.address())
            .map(String::from),
        to: address_list(message.to()),
        cc: address_list(message.cc()),
        reply_to: address_list(message.reply_to()),
        subject: message.subject().map(String::from),
        body,
        date: message.date().map(|d| from_ms(d.to_timestamp() * 1000)),
        attachments,
    })
}

fn address_list(addresses: Option<&mail_parser::Address<'_>>) -> Vec<String> {
    addresses
        .map(|list| {
            list.iter()
                .filter_map(|addr| addr.address())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn header_ids(message: &mail_parser::Message<'_>, name: &str) -> Vec<String> {
    match message.header(name) {
        Some(HeaderValue::Text(id)) => vec![id.to_string()],
        Some(HeaderValue::TextList(ids)) => ids.iter().map(|id| id.to_string()).collect(),
        _ => Vec::new(),
    }
}

fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), 80).unwrap_or_else(|_| html.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const PLAIN: &str = "\
Message-ID: <abc123@mail.example>\r\n\
In-Reply-To: <parent@hub.example>\r\n\
References: <root@hub.example> <parent@hub.example>\r\n\
From: Kim Vega <kim@example.com>\r\n\
To: support@hub.example\r\n\
Cc: audit@hub.example\r\n\
Subject: Re: Ticket #4821\r\n\
Date: Tue, 14 Nov 2023 12:00:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
The outage is back.\r\n";

    #[test]
    fn parses_threading_headers() {
        let parsed = parse_email(PLAIN.as_bytes()).unwrap();
        assert_eq!(parsed.message_id.as_deref(), Some("abc123@mail.example"));
        assert_eq!(parsed.in_reply_to, vec!["parent@hub.example"]);
        assert_eq!(
            parsed.references,
            vec!["root@hub.example", "parent@hub.example"]
        );
        assert_eq!(parsed.from.as_deref(), Some("kim@example.com"));
        assert_eq!(parsed.to, vec!["support@hub.example"]);
        assert_eq!(parsed.cc, vec!["audit@hub.example"]);
        assert_eq!(parsed.subject.as_deref(), Some("Re: Ticket #4821"));
        assert_eq!(parsed.body.trim(), "The outage is back.");
        assert!(parsed.date.is_some());
    }

    #[test]
    fn html_only_falls_back_to_derived_text() {
        let raw = "\
From: kim@example.com\r\n\
To: support@hub.example\r\n\
Subject: signal\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><body><p>No <b>signal</b> since noon.</p></body></html>\r\n";

        let parsed = parse_email(raw.as_bytes()).unwrap();
        assert!(parsed.body.contains("No"));
        assert!(parsed.body.contains("signal"));
        assert!(!parsed.body.contains("<b>"));
    }

    #[test]
    fn multipart_prefers_plain_text() {
        let raw = "\
From: kim@example.com\r\n\
To: support@hub.example\r\n\
Subject: both parts\r\n\
Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
plain wins\r\n\
--b1\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>html loses</p>\r\n\
--b1--\r\n";

        let parsed = parse_email(raw.as_bytes()).unwrap();
        assert_eq!(parsed.body.trim(), "plain wins");
    }

    #[test]
    fn extracts_attachments() {
        let raw = "\
From: kim@example.com\r\n\
To: support@hub.example\r\n\
Subject: modem photo\r\n\
Content-Type: multipart/mixed; boundary=\"b2\"\r\n\
\r\n\
--b2\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attached\r\n\
--b2\r\n\
Content-Type: image/png\r\n\
Content-Disposition: attachment; filename=\"modem.png\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw0KGgo=\r\n\
--b2--\r\n";

        let parsed = parse_email(raw.as_bytes()).unwrap();
        assert_eq!(parsed.body.trim(), "see attached");
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename, "modem.png");
        assert_eq!(parsed.attachments[0].content_type, "image/png");
        assert!(!parsed.attachments[0].bytes.is_empty());
    }
}
