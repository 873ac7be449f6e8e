//! IMAP mail source: raw IMAP over rustls, parsed with mail-parser.
//!
//! Messages are fetched with `BODY.PEEK[]` so the mailbox's seen flags are
//! left alone; the Ledger, not the server, decides what is unprocessed.

use std::io::{Read, Write as IoWrite};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};

use crate::config::env_parse;
use crate::error::{ConfigError, SourceError};
use crate::fingerprint::fingerprint;
use crate::source::{Attachment, MailSource, SourceItem, thread_id_from_subject};

// ── Configuration ───────────────────────────────────────────────────

/// IMAP source configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    /// Messages received within this many days are listed.
    pub lookback_days: u32,
    /// Empty means every sender is accepted.
    pub allowed_senders: Vec<String>,
}

impl ImapConfig {
    /// Build config from environment variables.
    /// Returns `Ok(None)` if `IMAP_HOST` is not set (source disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(host) = std::env::var("IMAP_HOST") else {
            return Ok(None);
        };

        let username = std::env::var("IMAP_USERNAME")
            .map_err(|_| ConfigError::MissingEnvVar("IMAP_USERNAME".into()))?;
        let password = std::env::var("IMAP_PASSWORD")
            .map_err(|_| ConfigError::MissingEnvVar("IMAP_PASSWORD".into()))?;

        let allowed_senders: Vec<String> = std::env::var("IMAP_ALLOWED_SENDERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Some(Self {
            host,
            port: env_parse("IMAP_PORT", 993)?,
            username,
            password: SecretString::from(password),
            mailbox: std::env::var("IMAP_MAILBOX").unwrap_or_else(|_| "INBOX".into()),
            lookback_days: env_parse("IMAP_LOOKBACK_DAYS", 1)?,
            allowed_senders,
        }))
    }

    /// Whether a sender passes the optional allow-list.
    pub fn is_sender_permitted(&self, email: &str) -> bool {
        self.allowed_senders.is_empty() || is_sender_allowed(&self.allowed_senders, email)
    }
}

// ── Source ──────────────────────────────────────────────────────────

/// IMAP-backed `MailSource`.
pub struct ImapSource {
    config: ImapConfig,
}

impl ImapSource {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailSource for ImapSource {
    fn name(&self) -> &str {
        "imap"
    }

    async fn list_unprocessed_items(&self) -> Result<Vec<SourceItem>, SourceError> {
        let cfg = self.config.clone();
        let since = Utc::now() - chrono::Duration::days(i64::from(cfg.lookback_days));
        let raw_messages = tokio::task::spawn_blocking(move || fetch_since_imap(&cfg, since))
            .await
            .map_err(|e| SourceError::Panicked(e.to_string()))??;

        let mut items = Vec::new();
        for raw in &raw_messages {
            let Some(item) = parse_message(raw) else {
                tracing::warn!(bytes = raw.len(), "Skipping unparseable message");
                continue;
            };
            if !self.config.is_sender_permitted(&item.sender) {
                tracing::info!(sender = %item.sender, "Blocked message from sender outside allow-list");
                continue;
            }
            if item.attachments.is_empty() {
                continue;
            }
            items.push(item);
        }

        tracing::info!(
            fetched = raw_messages.len(),
            with_attachments = items.len(),
            mailbox = %self.config.mailbox,
            "IMAP listing complete"
        );
        Ok(items)
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Check if a sender email is in the allowlist.
///
/// - Empty list → deny all
/// - `*` in list → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact email match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

/// Turn one raw RFC 822 message into a source item.
///
/// Returns `None` when the bytes are not a parseable message.
pub fn parse_message(raw: &[u8]) -> Option<SourceItem> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let source_id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("sha256:{}", fingerprint(raw)));
    let received_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let attachments = parsed
        .attachments()
        .enumerate()
        .map(|(index, part)| {
            let name = MimeHeaders::attachment_name(part)
                .map(|n| n.to_string())
                .unwrap_or_else(|| format!("attachment-{index}"));
            Attachment {
                id: format!("{index}:{name}"),
                name,
                bytes: part.contents().to_vec(),
            }
        })
        .collect();

    Some(SourceItem {
        source_id,
        thread_id: thread_id_from_subject(&subject),
        sender,
        subject,
        received_at,
        attachments,
    })
}

/// Parse the byte count of a trailing IMAP literal (`... {123}\r\n`).
pub fn literal_size(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    let inner = trimmed.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].parse().ok()
}

/// Quote a string for use as an IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// One authenticated IMAP conversation. Blocking; run in `spawn_blocking`.
struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    fn connect(config: &ImapConfig) -> Result<Self, SourceError> {
        let connect_err = |reason: String| SourceError::Connect {
            host: config.host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((&*config.host, config.port))
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))
            .map_err(|e| connect_err(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| connect_err(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
        };
        let _greeting = session.read_line()?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, SourceError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(SourceError::Protocol("IMAP connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(SourceError::Protocol(format!("IMAP read failed: {e}"))),
            }
        }
    }

    /// Send a tagged command; collect response lines and any literals.
    fn command(&mut self, cmd: &str) -> Result<(Vec<String>, Vec<Vec<u8>>), SourceError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let full = format!("{tag} {cmd}\r\n");
        self.tls
            .write_all(full.as_bytes())
            .and_then(|_| self.tls.flush())
            .map_err(|e| SourceError::Protocol(format!("IMAP write failed: {e}")))?;

        let mut lines = Vec::new();
        let mut literals = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(size) = literal_size(&line) {
                let mut literal = vec![0u8; size];
                self.tls
                    .read_exact(&mut literal)
                    .map_err(|e| SourceError::Protocol(format!("IMAP literal read failed: {e}")))?;
                literals.push(literal);
            }
            let done = line.starts_with(&format!("{tag} "));
            lines.push(line);
            if done {
                break;
            }
        }

        let tagged = lines.last().map(String::as_str).unwrap_or_default();
        check_completion(&tag, cmd, tagged)?;
        Ok((lines, literals))
    }
}

/// Classify a tagged completion line. `NO` refuses only this command;
/// `BAD` or anything unrecognised means the session can't be trusted.
fn check_completion(tag: &str, cmd: &str, tagged: &str) -> Result<(), SourceError> {
    let status = tagged.get(tag.len()..).unwrap_or_default().trim_start();
    if status.starts_with("OK") {
        return Ok(());
    }
    let verb = cmd.split_whitespace().next().unwrap_or(cmd);
    let reason = format!("{verb} failed: {}", tagged.trim());
    if status.starts_with("NO") {
        Err(SourceError::Rejected(reason))
    } else {
        Err(SourceError::Protocol(reason))
    }
}

/// Keep a fetched body or skip a message the server refused. Connection and
/// protocol failures end the listing so a partial mailbox is never reported.
fn keep_fetched(
    id: &str,
    response: Result<(Vec<String>, Vec<Vec<u8>>), SourceError>,
    messages: &mut Vec<Vec<u8>>,
) -> Result<(), SourceError> {
    match response {
        Ok((_, mut literals)) if !literals.is_empty() => messages.push(literals.remove(0)),
        Ok(_) => tracing::warn!(id = %id, "FETCH returned no message body"),
        Err(SourceError::Rejected(reason)) => {
            tracing::warn!(id = %id, reason = %reason, "Server refused FETCH, skipping message")
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Fetch every message received since `since` (blocking).
fn fetch_since_imap(
    config: &ImapConfig,
    since: DateTime<Utc>,
) -> Result<Vec<Vec<u8>>, SourceError> {
    let mut session = ImapSession::connect(config)?;

    let login = format!(
        "LOGIN {} {}",
        quote(&config.username),
        quote(config.password.expose_secret())
    );
    session
        .command(&login)
        .map_err(|e| match e {
            SourceError::Rejected(_) => SourceError::AuthFailed {
                user: config.username.clone(),
            },
            other => other,
        })?;

    session.command(&format!("SELECT {}", quote(&config.mailbox)))?;

    let (search_resp, _) = session.command(&format!("SEARCH SINCE {}", since.format("%d-%b-%Y")))?;
    let mut ids: Vec<String> = Vec::new();
    for line in &search_resp {
        if line.starts_with("* SEARCH") {
            ids.extend(line.split_whitespace().skip(2).map(|s| s.to_string()));
        }
    }
    tracing::debug!(count = ids.len(), mailbox = %config.mailbox, "IMAP search results");

    let mut messages = Vec::new();
    for id in &ids {
        let response = session.command(&format!("FETCH {id} BODY.PEEK[]"));
        keep_fetched(id, response, &mut messages)?;
    }

    let _ = session.command("LOGOUT");
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "From: Alice <alice@example.com>\r\n\
To: docs@example.com\r\n\
Subject: Re: Quotation 42\r\n\
Message-ID: <abc123@example.com>\r\n\
Date: Wed, 01 Jan 2025 09:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain\r\n\
\r\n\
Please find the quote attached.\r\n\
--XYZ\r\n\
Content-Type: application/pdf; name=\"quote.pdf\"\r\n\
Content-Disposition: attachment; filename=\"quote.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--XYZ--\r\n";

    #[test]
    fn parse_message_extracts_identity_and_attachment() {
        let item = parse_message(SAMPLE.as_bytes()).unwrap();
        assert_eq!(item.source_id, "abc123@example.com");
        assert_eq!(item.sender, "alice@example.com");
        assert_eq!(item.subject, "Re: Quotation 42");
        assert_eq!(item.thread_id, "Quotation 42");
        assert_eq!(item.received_at.to_rfc3339(), "2025-01-01T09:00:00+00:00");

        assert_eq!(item.attachments.len(), 1);
        let att = &item.attachments[0];
        assert_eq!(att.name, "quote.pdf");
        assert_eq!(att.id, "0:quote.pdf");
        assert_eq!(att.bytes, b"%PDF-1.4\n");
    }

    #[test]
    fn parse_message_without_message_id_uses_content_hash() {
        let raw = SAMPLE.replace("Message-ID: <abc123@example.com>\r\n", "");
        let item = parse_message(raw.as_bytes()).unwrap();
        assert!(item.source_id.starts_with("sha256:"));
        // Stable across re-fetches of the same bytes
        assert_eq!(parse_message(raw.as_bytes()).unwrap().source_id, item.source_id);
    }

    #[test]
    fn literal_size_parses_trailing_count() {
        assert_eq!(literal_size("* 3 FETCH (BODY[] {1234}\r\n"), Some(1234));
        assert_eq!(literal_size("* 3 FETCH (FLAGS (\\Seen))\r\n"), None);
        assert_eq!(literal_size("A4 OK FETCH completed\r\n"), None);
    }

    #[test]
    fn tagged_completion_distinguishes_no_from_bad() {
        assert!(check_completion("A4", "FETCH 7 BODY.PEEK[]", "A4 OK FETCH completed\r\n").is_ok());
        assert!(matches!(
            check_completion("A4", "FETCH 7 BODY.PEEK[]", "A4 NO [EXPUNGEISSUED] gone\r\n"),
            Err(SourceError::Rejected(reason)) if reason.starts_with("FETCH failed")
        ));
        assert!(matches!(
            check_completion("A4", "FETCH 7 BODY.PEEK[]", "A4 BAD parse error\r\n"),
            Err(SourceError::Protocol(_))
        ));
        assert!(matches!(
            check_completion("A4", "FETCH", ""),
            Err(SourceError::Protocol(_))
        ));
    }

    #[test]
    fn refused_fetch_is_skipped_but_a_dropped_connection_aborts() {
        let mut messages = Vec::new();

        keep_fetched("1", Ok((vec![], vec![b"first".to_vec()])), &mut messages).unwrap();
        keep_fetched(
            "2",
            Err(SourceError::Rejected("FETCH failed: A5 NO gone".into())),
            &mut messages,
        )
        .unwrap();
        assert_eq!(messages, vec![b"first".to_vec()]);

        let result = keep_fetched(
            "3",
            Err(SourceError::Protocol("IMAP connection closed".into())),
            &mut messages,
        );
        assert!(matches!(result, Err(SourceError::Protocol(_))));
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn quote_escapes_specials() {
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[test]
    fn allowlist_wildcard() {
        assert!(is_sender_allowed(&["*".into()], "anyone@anywhere.com"));
    }

    #[test]
    fn allowlist_domain_forms() {
        let allowed = vec!["@example.com".to_string(), "supplier.de".to_string()];
        assert!(is_sender_allowed(&allowed, "Alice@Example.com"));
        assert!(is_sender_allowed(&allowed, "sales@supplier.de"));
        assert!(!is_sender_allowed(&allowed, "sales@notsupplier.de"));
    }

    #[test]
    fn allowlist_exact_email() {
        let allowed = vec!["boss@corp.com".to_string()];
        assert!(is_sender_allowed(&allowed, "BOSS@corp.com"));
        assert!(!is_sender_allowed(&allowed, "intern@corp.com"));
    }

    #[test]
    fn empty_allowlist_permits_everyone_for_the_source() {
        let config = ImapConfig {
            host: "imap.test.com".into(),
            port: 993,
            username: "user".into(),
            password: SecretString::from("pass"),
            mailbox: "INBOX".into(),
            lookback_days: 1,
            allowed_senders: vec![],
        };
        assert!(config.is_sender_permitted("someone@example.com"));
        assert!(!is_sender_allowed(&[], "someone@example.com"));
    }

    #[test]
    fn config_from_env_returns_none_when_no_host() {
        // SAFETY: This test runs in isolation; no other thread reads IMAP_HOST concurrently.
        unsafe { std::env::remove_var("IMAP_HOST") };
        assert!(ImapConfig::from_env().unwrap().is_none());
    }
}
