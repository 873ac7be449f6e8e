//! The `Ledger` trait: single source of truth for per-item processing status.
//!
//! One row per item (email attachment), keyed by `(source_id, attachment_id)`.
//! Rows are created once by Fetch and advanced in place by the stage runners;
//! they are never deleted.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;

use crate::error::{FailureKind, LedgerError, StageError};

// ── Identity ────────────────────────────────────────────────────────

/// Composite identity of a Ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ItemKey {
    pub source_id: String,
    pub attachment_id: String,
}

impl ItemKey {
    pub fn new(source_id: impl Into<String>, attachment_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            attachment_id: attachment_id.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_id, self.attachment_id)
    }
}

// ── Status ──────────────────────────────────────────────────────────

/// Processing status of a row.
///
/// Forward order is `Discovered → Downloaded → Extracted → Converted`.
/// `Failed` is reachable from every non-terminal status and remembers where
/// it came from so a retry re-enters the stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Discovered,
    Downloaded,
    Extracted,
    Converted,
    Failed,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Discovered,
        Status::Downloaded,
        Status::Extracted,
        Status::Converted,
        Status::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Discovered => "discovered",
            Status::Downloaded => "downloaded",
            Status::Extracted => "extracted",
            Status::Converted => "converted",
            Status::Failed => "failed",
        }
    }

    /// The status a row must hold (directly, or as `failed_from`) before
    /// it may move to `self`. `None` for `Discovered` (insert only) and
    /// `Failed` (reachable from anywhere non-terminal).
    pub fn predecessor(&self) -> Option<Status> {
        match self {
            Status::Downloaded => Some(Status::Discovered),
            Status::Extracted => Some(Status::Downloaded),
            Status::Converted => Some(Status::Extracted),
            Status::Discovered | Status::Failed => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(Status::Discovered),
            "downloaded" => Ok(Status::Downloaded),
            "extracted" => Ok(Status::Extracted),
            "converted" => Ok(Status::Converted),
            "failed" => Ok(Status::Failed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Whether a row in `current` (with `failed_from` when failed) may move to `to`.
pub fn transition_allowed(current: Status, failed_from: Option<Status>, to: Status) -> bool {
    match to {
        Status::Discovered => false,
        Status::Failed => current != Status::Converted,
        forward => {
            let Some(pre) = forward.predecessor() else {
                return false;
            };
            current == pre || (current == Status::Failed && failed_from == Some(pre))
        }
    }
}

// ── Stages ──────────────────────────────────────────────────────────

/// One forward transition in an item's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Extract,
    Convert,
}

impl Stage {
    pub const ORDER: [Stage; 3] = [Stage::Fetch, Stage::Extract, Stage::Convert];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Convert => "convert",
        }
    }

    /// Status a row must hold for this stage to act on it.
    pub fn precondition(&self) -> Status {
        match self {
            Stage::Fetch => Status::Discovered,
            Stage::Extract => Status::Downloaded,
            Stage::Convert => Status::Extracted,
        }
    }

    /// Status this stage writes on success.
    pub fn postcondition(&self) -> Status {
        match self {
            Stage::Fetch => Status::Downloaded,
            Stage::Extract => Status::Extracted,
            Stage::Convert => Status::Converted,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Rows ────────────────────────────────────────────────────────────

/// Everything Fetch knows about an item when it first claims it.
#[derive(Debug, Clone)]
pub struct NewRow {
    pub key: ItemKey,
    pub thread_id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub attachment_name: String,
    pub stored_path: String,
    pub content_hash: String,
    pub message_hash: String,
    pub discovered_at: DateTime<Utc>,
}

/// Completion time of each stage. Each is written once and never overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageTimestamps {
    pub discovered_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub extracted_at: Option<DateTime<Utc>>,
    pub converted_at: Option<DateTime<Utc>>,
}

impl StageTimestamps {
    pub fn get(&self, status: Status) -> Option<DateTime<Utc>> {
        match status {
            Status::Discovered => self.discovered_at,
            Status::Downloaded => self.downloaded_at,
            Status::Extracted => self.extracted_at,
            Status::Converted => self.converted_at,
            Status::Failed => None,
        }
    }
}

/// Artifact paths and classification written together with a transition.
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    pub text_path: Option<String>,
    pub result_path: Option<String>,
    pub schema_id: Option<String>,
}

/// A persisted Ledger row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerRow {
    /// Insertion order; the cursor for `rows_pending`.
    pub seq: i64,
    pub key: ItemKey,
    pub thread_id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub attachment_name: String,
    pub stored_path: String,
    pub content_hash: String,
    pub message_hash: String,
    pub status: Status,
    /// Status held when the row last failed.
    pub failed_from: Option<Status>,
    pub failure_kind: Option<FailureKind>,
    pub retryable: bool,
    pub error_detail: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub stage_timestamps: StageTimestamps,
    pub text_path: Option<String>,
    pub result_path: Option<String>,
    pub schema_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerRow {
    /// Whether `stage` would act on this row right now.
    pub fn is_pending_for(&self, stage: Stage) -> bool {
        let pre = stage.precondition();
        self.status == pre
            || (self.status == Status::Failed && self.retryable && self.failed_from == Some(pre))
    }

    /// Lowercased file extension of the stored file, if any.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.attachment_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

/// Result of `Ledger::upsert`.
#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    /// First time this content hash was seen; the row now exists as `discovered`.
    Inserted(LedgerRow),
    /// The content hash is already claimed by `existing`. Expected, not an error.
    Duplicate { existing: LedgerRow },
}

/// Aggregate statistics over the Ledger.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerSummary {
    pub total: usize,
    pub by_status: BTreeMap<Status, usize>,
    pub unique_sources: usize,
    pub unique_threads: usize,
    pub unique_senders: usize,
    pub by_extension: BTreeMap<String, usize>,
    /// Most recently created rows, newest first.
    pub recent: Vec<LedgerRow>,
}

impl LedgerSummary {
    /// Build statistics from a full row listing.
    pub fn from_rows(rows: &[LedgerRow], recent: usize) -> Self {
        let mut by_status = BTreeMap::new();
        let mut by_extension = BTreeMap::new();
        let mut sources = HashSet::new();
        let mut threads = HashSet::new();
        let mut senders = HashSet::new();

        for row in rows {
            *by_status.entry(row.status).or_insert(0) += 1;
            let ext = row.extension().unwrap_or_else(|| "(none)".to_string());
            *by_extension.entry(ext).or_insert(0) += 1;
            sources.insert(row.key.source_id.as_str());
            threads.insert(row.thread_id.as_str());
            senders.insert(row.sender.as_str());
        }

        let mut newest: Vec<&LedgerRow> = rows.iter().collect();
        newest.sort_by(|a, b| b.seq.cmp(&a.seq));

        Self {
            total: rows.len(),
            by_status,
            unique_sources: sources.len(),
            unique_threads: threads.len(),
            unique_senders: senders.len(),
            by_extension,
            recent: newest.into_iter().take(recent).cloned().collect(),
        }
    }

    pub fn count(&self, status: Status) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

// ── Trait ───────────────────────────────────────────────────────────

/// Durable, append-biased store of per-item processing status.
///
/// Every write is committed before the call returns. `advance` is a
/// compare-and-set: it only applies if the row still holds the status the
/// transition requires, so two concurrent runs cannot both advance a row.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert a `discovered` row unless its content hash is already claimed.
    async fn upsert(&self, row: &NewRow) -> Result<UpsertOutcome, LedgerError>;

    /// Transition a row and record artifacts in the same write.
    ///
    /// Fails with `InvalidTransition` (row untouched) when `to` does not
    /// directly follow the row's status, or when the row changed between
    /// read and write.
    async fn advance_with(
        &self,
        key: &ItemKey,
        to: Status,
        at: DateTime<Utc>,
        error: Option<&StageError>,
        artifacts: &Artifacts,
    ) -> Result<LedgerRow, LedgerError>;

    /// Transition a row without recording artifacts.
    async fn advance(
        &self,
        key: &ItemKey,
        to: Status,
        at: DateTime<Utc>,
        error: Option<&StageError>,
    ) -> Result<LedgerRow, LedgerError> {
        self.advance_with(key, to, at, error, &Artifacts::default())
            .await
    }

    /// First row after `after_seq` that `stage` should act on.
    async fn next_pending(
        &self,
        stage: Stage,
        after_seq: i64,
    ) -> Result<Option<LedgerRow>, LedgerError>;

    async fn get(&self, key: &ItemKey) -> Result<Option<LedgerRow>, LedgerError>;

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<LedgerRow>, LedgerError>;

    /// Whether any row already owns `stored_path`.
    async fn path_in_use(&self, stored_path: &str) -> Result<bool, LedgerError>;

    /// All rows in insertion order.
    async fn list_rows(&self) -> Result<Vec<LedgerRow>, LedgerError>;

    /// Make a failed row eligible for the next run's retry of its stage.
    async fn rearm(&self, key: &ItemKey) -> Result<LedgerRow, LedgerError>;

    /// Statistics view over all rows.
    async fn summary(&self, recent: usize) -> Result<LedgerSummary, LedgerError> {
        let rows = self.list_rows().await?;
        Ok(LedgerSummary::from_rows(&rows, recent))
    }

    /// Lazy, finite sequence of rows `stage` should act on.
    ///
    /// Walks the Ledger by `seq`, re-reading current state for each step, so
    /// rows committed by an earlier stage in the same run are seen and a row
    /// is yielded at most once per call. A row that fails during iteration is
    /// not revisited until the next call.
    fn rows_pending(&self, stage: Stage) -> BoxStream<'_, Result<LedgerRow, LedgerError>> {
        Box::pin(futures::stream::unfold(Some(0_i64), move |cursor| async move {
            let after = cursor?;
            match self.next_pending(stage, after).await {
                Ok(Some(row)) => {
                    let seq = row.seq;
                    Some((Ok(row), Some(seq)))
                }
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        }))
    }
}
