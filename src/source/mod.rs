//! Mail sources: where pipeline items come from.
//!
//! A source lists messages with their attachments. It knows nothing about
//! the Ledger; deciding what is new is the Fetch stage's job.

pub mod imap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SourceError;

pub use imap::{ImapConfig, ImapSource};

/// One attachment of a source message.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Stable within the message (positional index plus file name).
    pub id: String,
    pub name: String,
    pub bytes: Vec<u8>,
}

/// One source message and its attachments.
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub source_id: String,
    pub thread_id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

/// A mailbox (or anything shaped like one) that yields attachment-bearing messages.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Messages that may carry unprocessed attachments.
    ///
    /// May return messages seen on earlier runs; the Ledger filters them.
    async fn list_unprocessed_items(&self) -> Result<Vec<SourceItem>, SourceError>;
}

/// Grouping key for related messages: the subject without reply/forward prefixes.
pub fn thread_id_from_subject(subject: &str) -> String {
    const PREFIXES: &[&str] = &["re:", "fwd:", "fw:", "aw:"];

    let mut rest = subject.trim();
    loop {
        let lower = rest.to_ascii_lowercase();
        match PREFIXES.iter().find(|p| lower.starts_with(*p)) {
            Some(prefix) => rest = rest[prefix.len()..].trim_start(),
            None => break,
        }
    }
    if rest.is_empty() {
        "(no subject)".to_string()
    } else {
        rest.to_string()
    }
}
