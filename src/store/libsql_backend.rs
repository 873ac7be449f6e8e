//! libSQL backend: async `Ledger` trait implementation.
//!
//! Supports local file and in-memory databases. Every statement runs in
//! autocommit mode, so a write is durable by the time the call returns.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, FailureKind, LedgerError, StageError};
use crate::store::migrations;
use crate::store::traits::{
    Artifacts, ItemKey, Ledger, LedgerRow, NewRow, Stage, StageTimestamps, Status, UpsertOutcome,
    transition_allowed,
};

/// How long a writer waits on a lock held by another invocation.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// libSQL Ledger backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlLedger {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let ledger = Self {
            db: Arc::new(db),
            conn,
        };
        ledger.pragma(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")).await?;
        ledger.pragma("PRAGMA journal_mode = WAL").await?;
        migrations::run_migrations(ledger.conn()).await?;
        info!(path = %path.display(), "Ledger opened");
        Ok(ledger)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let ledger = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(ledger.conn()).await?;
        Ok(ledger)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a PRAGMA. Some of them return a row, so go through `query`.
    async fn pragma(&self, sql: &str) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
        while let Ok(Some(_)) = rows.next().await {}
        Ok(())
    }

    async fn query_one(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<LedgerRow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_ledger_row(&row, op)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    /// Write the transition only if the row still holds `current.status`.
    ///
    /// Zero affected rows means another invocation moved the row after
    /// `current` was read; that is reported as `InvalidTransition`.
    async fn compare_and_set(
        &self,
        current: &LedgerRow,
        to: Status,
        at: DateTime<Utc>,
        error: Option<&StageError>,
        artifacts: &Artifacts,
    ) -> Result<LedgerRow, LedgerError> {
        let key = &current.key;
        let at_str = at.to_rfc3339();
        let changed = match timestamp_column(to) {
            None => {
                let fallback;
                let error = match error {
                    Some(e) => e,
                    None => {
                        fallback = StageError::content("failed without error detail");
                        &fallback
                    }
                };
                let failed_from = match current.status {
                    Status::Failed => current.failed_from.unwrap_or(Status::Discovered),
                    other => other,
                };
                self.conn()
                    .execute(
                        "UPDATE ledger SET status = 'failed', failed_from = ?1, failure_kind = ?2,
                            retryable = ?3, error_detail = ?4, failed_at = ?5, updated_at = ?5
                         WHERE source_id = ?6 AND attachment_id = ?7 AND status = ?8",
                        params![
                            failed_from.as_str(),
                            error.kind.as_str(),
                            i64::from(error.kind.is_retryable()),
                            error.message.as_str(),
                            at_str,
                            key.source_id.as_str(),
                            key.attachment_id.as_str(),
                            current.status.as_str()
                        ],
                    )
                    .await
            }
            Some(column) => {
                self.conn()
                    .execute(
                        &format!(
                            "UPDATE ledger SET status = ?1, {column} = COALESCE({column}, ?2),
                                error_detail = NULL, failure_kind = NULL, retryable = 0,
                                text_path = COALESCE(?3, text_path),
                                result_path = COALESCE(?4, result_path),
                                schema_id = COALESCE(?5, schema_id),
                                updated_at = ?2
                             WHERE source_id = ?6 AND attachment_id = ?7 AND status = ?8"
                        ),
                        params![
                            to.as_str(),
                            at_str,
                            opt_text(artifacts.text_path.as_deref()),
                            opt_text(artifacts.result_path.as_deref()),
                            opt_text(artifacts.schema_id.as_deref()),
                            key.source_id.as_str(),
                            key.attachment_id.as_str(),
                            current.status.as_str()
                        ],
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("advance: {e}")))?;

        let updated = self
            .get(key)
            .await?
            .ok_or_else(|| LedgerError::NotFound { key: key.clone() })?;

        if changed == 0 {
            // Lost the compare-and-set to another invocation.
            warn!(key = %key, from = %updated.status, to = %to, "Ledger row changed underneath advance");
            return Err(LedgerError::InvalidTransition {
                key: key.clone(),
                from: updated.status,
                to,
            });
        }

        debug!(key = %key, from = %current.status, to = %to, "Ledger row advanced");
        Ok(updated)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str, column: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Query(format!(
        "unparseable timestamp in {column}: {s:?}"
    )))
}

fn parse_optional_datetime(
    s: &Option<String>,
    column: &str,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(|s| parse_datetime(s, column)).transpose()
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Column holding the completion time of the stage that produces `status`.
fn timestamp_column(status: Status) -> Option<&'static str> {
    match status {
        Status::Discovered => Some("discovered_at"),
        Status::Downloaded => Some("downloaded_at"),
        Status::Extracted => Some("extracted_at"),
        Status::Converted => Some("converted_at"),
        Status::Failed => None,
    }
}

const LEDGER_COLUMNS: &str = "seq, source_id, attachment_id, thread_id, sender, subject, \
    received_at, attachment_name, stored_path, content_hash, message_hash, status, \
    failed_from, failure_kind, retryable, error_detail, failed_at, discovered_at, \
    downloaded_at, extracted_at, converted_at, text_path, result_path, schema_id, \
    created_at, updated_at";

/// Map a libsql Row to a LedgerRow. Column order matches LEDGER_COLUMNS.
fn row_to_ledger_row(row: &libsql::Row, op: &str) -> Result<LedgerRow, DatabaseError> {
    let err = |e: libsql::Error| DatabaseError::Query(format!("{op} row parse: {e}"));

    let status_str: String = row.get(11).map_err(err)?;
    let status: Status = status_str
        .parse()
        .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;

    let failed_from = match row.get::<String>(12).ok() {
        Some(s) => Some(
            s.parse::<Status>()
                .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?,
        ),
        None => None,
    };
    let failure_kind = match row.get::<String>(13).ok() {
        Some(s) => Some(
            s.parse::<FailureKind>()
                .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?,
        ),
        None => None,
    };

    let received_str: String = row.get(6).map_err(err)?;
    let failed_at: Option<String> = row.get(16).ok();
    let discovered_at: Option<String> = row.get(17).ok();
    let downloaded_at: Option<String> = row.get(18).ok();
    let extracted_at: Option<String> = row.get(19).ok();
    let converted_at: Option<String> = row.get(20).ok();
    let created_str: String = row.get(24).map_err(err)?;
    let updated_str: String = row.get(25).map_err(err)?;

    Ok(LedgerRow {
        seq: row.get(0).map_err(err)?,
        key: ItemKey::new(
            row.get::<String>(1).map_err(err)?,
            row.get::<String>(2).map_err(err)?,
        ),
        thread_id: row.get(3).map_err(err)?,
        sender: row.get(4).map_err(err)?,
        subject: row.get(5).map_err(err)?,
        received_at: parse_datetime(&received_str, "received_at")?,
        attachment_name: row.get(7).map_err(err)?,
        stored_path: row.get(8).map_err(err)?,
        content_hash: row.get(9).map_err(err)?,
        message_hash: row.get(10).map_err(err)?,
        status,
        failed_from,
        failure_kind,
        retryable: row.get::<i64>(14).map_err(err)? != 0,
        error_detail: row.get(15).ok(),
        failed_at: parse_optional_datetime(&failed_at, "failed_at")?,
        stage_timestamps: StageTimestamps {
            discovered_at: parse_optional_datetime(&discovered_at, "discovered_at")?,
            downloaded_at: parse_optional_datetime(&downloaded_at, "downloaded_at")?,
            extracted_at: parse_optional_datetime(&extracted_at, "extracted_at")?,
            converted_at: parse_optional_datetime(&converted_at, "converted_at")?,
        },
        text_path: row.get(21).ok(),
        result_path: row.get(22).ok(),
        schema_id: row.get(23).ok(),
        created_at: parse_datetime(&created_str, "created_at")?,
        updated_at: parse_datetime(&updated_str, "updated_at")?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Ledger for LibSqlLedger {
    async fn upsert(&self, row: &NewRow) -> Result<UpsertOutcome, LedgerError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "INSERT INTO ledger (source_id, attachment_id, thread_id, sender, subject,
                    received_at, attachment_name, stored_path, content_hash, message_hash,
                    status, discovered_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'discovered', ?11, ?12, ?12)
                 ON CONFLICT DO NOTHING",
                params![
                    row.key.source_id.as_str(),
                    row.key.attachment_id.as_str(),
                    row.thread_id.as_str(),
                    row.sender.as_str(),
                    row.subject.as_str(),
                    row.received_at.to_rfc3339(),
                    row.attachment_name.as_str(),
                    row.stored_path.as_str(),
                    row.content_hash.as_str(),
                    row.message_hash.as_str(),
                    row.discovered_at.to_rfc3339(),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert: {e}")))?;

        if changed > 0 {
            let inserted = self
                .get(&row.key)
                .await?
                .ok_or_else(|| LedgerError::NotFound {
                    key: row.key.clone(),
                })?;
            debug!(key = %row.key, hash = %row.content_hash, "Ledger row discovered");
            return Ok(UpsertOutcome::Inserted(inserted));
        }

        // Nothing inserted: the hash, the key, or the stored path is taken.
        if let Some(existing) = self.find_by_hash(&row.content_hash).await? {
            debug!(
                key = %row.key,
                existing = %existing.key,
                hash = %row.content_hash,
                "Duplicate content hash"
            );
            return Ok(UpsertOutcome::Duplicate { existing });
        }
        if let Some(existing) = self.get(&row.key).await? {
            return Ok(UpsertOutcome::Duplicate { existing });
        }
        Err(DatabaseError::Constraint(format!(
            "stored path {} already belongs to another row",
            row.stored_path
        ))
        .into())
    }

    async fn advance_with(
        &self,
        key: &ItemKey,
        to: Status,
        at: DateTime<Utc>,
        error: Option<&StageError>,
        artifacts: &Artifacts,
    ) -> Result<LedgerRow, LedgerError> {
        let current = self
            .get(key)
            .await?
            .ok_or_else(|| LedgerError::NotFound { key: key.clone() })?;

        if !transition_allowed(current.status, current.failed_from, to) {
            return Err(LedgerError::InvalidTransition {
                key: key.clone(),
                from: current.status,
                to,
            });
        }

        self.compare_and_set(&current, to, at, error, artifacts).await
    }

    async fn next_pending(
        &self,
        stage: Stage,
        after_seq: i64,
    ) -> Result<Option<LedgerRow>, LedgerError> {
        let pre = stage.precondition().as_str();
        Ok(self
            .query_one(
                "next_pending",
                &format!(
                    "SELECT {LEDGER_COLUMNS} FROM ledger
                     WHERE seq > ?1
                       AND (status = ?2 OR (status = 'failed' AND failed_from = ?2 AND retryable = 1))
                     ORDER BY seq ASC LIMIT 1"
                ),
                params![after_seq, pre],
            )
            .await?)
    }

    async fn get(&self, key: &ItemKey) -> Result<Option<LedgerRow>, LedgerError> {
        Ok(self
            .query_one(
                "get",
                &format!(
                    "SELECT {LEDGER_COLUMNS} FROM ledger WHERE source_id = ?1 AND attachment_id = ?2"
                ),
                params![key.source_id.as_str(), key.attachment_id.as_str()],
            )
            .await?)
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<LedgerRow>, LedgerError> {
        Ok(self
            .query_one(
                "find_by_hash",
                &format!("SELECT {LEDGER_COLUMNS} FROM ledger WHERE content_hash = ?1"),
                params![content_hash],
            )
            .await?)
    }

    async fn path_in_use(&self, stored_path: &str) -> Result<bool, LedgerError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM ledger WHERE stored_path = ?1 LIMIT 1",
                params![stored_path],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("path_in_use: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("path_in_use: {e}")).into()),
        }
    }

    async fn list_rows(&self) -> Result<Vec<LedgerRow>, LedgerError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEDGER_COLUMNS} FROM ledger ORDER BY seq ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rows: {e}")))?;

        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => out.push(row_to_ledger_row(&row, "list_rows")?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_rows: {e}")).into()),
            }
        }
        Ok(out)
    }

    async fn rearm(&self, key: &ItemKey) -> Result<LedgerRow, LedgerError> {
        let current = self
            .get(key)
            .await?
            .ok_or_else(|| LedgerError::NotFound { key: key.clone() })?;

        if current.status != Status::Failed {
            return Err(LedgerError::InvalidTransition {
                key: key.clone(),
                from: current.status,
                to: Status::Failed,
            });
        }

        self.conn()
            .execute(
                "UPDATE ledger SET retryable = 1, updated_at = ?1
                 WHERE source_id = ?2 AND attachment_id = ?3 AND status = 'failed'",
                params![
                    Utc::now().to_rfc3339(),
                    key.source_id.as_str(),
                    key.attachment_id.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("rearm: {e}")))?;

        info!(key = %key, failed_from = ?current.failed_from, "Failed row re-armed for retry");
        self.get(key)
            .await?
            .ok_or_else(|| LedgerError::NotFound { key: key.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use futures::StreamExt;

    async fn test_db() -> LibSqlLedger {
        LibSqlLedger::new_memory().await.unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap()
    }

    fn make_row(source: &str, name: &str, hash: &str) -> NewRow {
        NewRow {
            key: ItemKey::new(source, format!("0:{name}")),
            thread_id: "Quote".into(),
            sender: "alice@example.com".into(),
            subject: "Re: Quote".into(),
            received_at: t0(),
            attachment_name: name.into(),
            stored_path: format!("download/{source}_{name}"),
            content_hash: hash.into(),
            message_hash: format!("m-{source}"),
            discovered_at: t0(),
        }
    }

    async fn insert(db: &LibSqlLedger, row: &NewRow) -> LedgerRow {
        match db.upsert(row).await.unwrap() {
            UpsertOutcome::Inserted(r) => r,
            UpsertOutcome::Duplicate { .. } => panic!("expected insert"),
        }
    }

    // ── Upsert ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_inserts_discovered_row() {
        let db = test_db().await;
        let row = insert(&db, &make_row("A", "quote.pdf", "h1")).await;

        assert_eq!(row.status, Status::Discovered);
        assert_eq!(row.content_hash, "h1");
        assert_eq!(row.stage_timestamps.discovered_at, Some(t0()));
        assert!(row.stage_timestamps.downloaded_at.is_none());
        assert!(row.error_detail.is_none());
        assert!(!row.retryable);
    }

    #[tokio::test]
    async fn upsert_same_hash_other_source_is_duplicate() {
        let db = test_db().await;
        let first = insert(&db, &make_row("A", "quote.pdf", "h1")).await;

        let outcome = db.upsert(&make_row("B", "copy.pdf", "h1")).await.unwrap();
        match outcome {
            UpsertOutcome::Duplicate { existing } => assert_eq!(existing.key, first.key),
            UpsertOutcome::Inserted(_) => panic!("same hash must not insert"),
        }
        assert_eq!(db.list_rows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_same_key_is_duplicate_not_error() {
        let db = test_db().await;
        let row = make_row("A", "quote.pdf", "h1");
        insert(&db, &row).await;

        let outcome = db.upsert(&row).await.unwrap();
        assert!(matches!(outcome, UpsertOutcome::Duplicate { .. }));
    }

    #[tokio::test]
    async fn upsert_rejects_reused_stored_path() {
        let db = test_db().await;
        insert(&db, &make_row("A", "quote.pdf", "h1")).await;

        let mut other = make_row("B", "quote.pdf", "h2");
        other.stored_path = "download/A_quote.pdf".into();
        let result = db.upsert(&other).await;
        assert!(matches!(
            result,
            Err(LedgerError::Database(DatabaseError::Constraint(_)))
        ));
    }

    // ── Advance ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn advance_walks_forward_and_stamps_once() {
        let db = test_db().await;
        let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;

        let t1 = t0() + Duration::minutes(1);
        let t2 = t0() + Duration::minutes(2);
        let t3 = t0() + Duration::minutes(3);
        db.advance(&key, Status::Downloaded, t1, None).await.unwrap();
        db.advance(&key, Status::Extracted, t2, None).await.unwrap();
        let row = db.advance(&key, Status::Converted, t3, None).await.unwrap();

        assert_eq!(row.status, Status::Converted);
        assert_eq!(row.stage_timestamps.downloaded_at, Some(t1));
        assert_eq!(row.stage_timestamps.extracted_at, Some(t2));
        assert_eq!(row.stage_timestamps.converted_at, Some(t3));
    }

    #[tokio::test]
    async fn advance_skipping_a_stage_is_invalid_and_leaves_row_untouched() {
        let db = test_db().await;
        let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;

        let err = db
            .advance(&key, Status::Extracted, t0(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidTransition {
                from: Status::Discovered,
                to: Status::Extracted,
                ..
            }
        ));

        let row = db.get(&key).await.unwrap().unwrap();
        assert_eq!(row.status, Status::Discovered);
        assert!(row.stage_timestamps.extracted_at.is_none());
    }

    #[tokio::test]
    async fn advance_twice_to_same_status_is_invalid() {
        let db = test_db().await;
        let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;
        db.advance(&key, Status::Downloaded, t0(), None).await.unwrap();

        let err = db
            .advance(&key, Status::Downloaded, t0() + Duration::hours(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        let row = db.get(&key).await.unwrap().unwrap();
        assert_eq!(row.stage_timestamps.downloaded_at, Some(t0()));
    }

    #[tokio::test]
    async fn advance_unknown_row_is_not_found() {
        let db = test_db().await;
        let err = db
            .advance(&ItemKey::new("nope", "0:x.pdf"), Status::Downloaded, t0(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn advance_records_artifacts() {
        let db = test_db().await;
        let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;
        db.advance(&key, Status::Downloaded, t0(), None).await.unwrap();

        let artifacts = Artifacts {
            text_path: Some("output/A_quote.pdf.md".into()),
            ..Default::default()
        };
        let row = db
            .advance_with(&key, Status::Extracted, t0(), None, &artifacts)
            .await
            .unwrap();
        assert_eq!(row.text_path.as_deref(), Some("output/A_quote.pdf.md"));

        // Artifact-free advance keeps what was recorded before
        let row = db
            .advance(&key, Status::Converted, t0(), None)
            .await
            .unwrap();
        assert_eq!(row.text_path.as_deref(), Some("output/A_quote.pdf.md"));
    }

    #[tokio::test]
    async fn stale_compare_and_set_is_rejected_and_leaves_row_untouched() {
        let db = test_db().await;
        let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;
        db.advance(&key, Status::Downloaded, t0(), None).await.unwrap();

        // Read the row, then let another writer move it on.
        let stale = db.get(&key).await.unwrap().unwrap();
        let t1 = t0() + Duration::minutes(1);
        db.advance(&key, Status::Extracted, t1, None).await.unwrap();

        let artifacts = Artifacts {
            text_path: Some("output/late.md".into()),
            ..Default::default()
        };
        let err = db
            .compare_and_set(
                &stale,
                Status::Extracted,
                t0() + Duration::minutes(5),
                None,
                &artifacts,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidTransition {
                from: Status::Extracted,
                to: Status::Extracted,
                ..
            }
        ));

        let row = db.get(&key).await.unwrap().unwrap();
        assert_eq!(row.status, Status::Extracted);
        assert_eq!(row.stage_timestamps.extracted_at, Some(t1));
        assert!(row.text_path.is_none());
    }

    #[tokio::test]
    async fn stale_failure_does_not_overwrite_a_newer_status() {
        let db = test_db().await;
        let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;
        db.advance(&key, Status::Downloaded, t0(), None).await.unwrap();

        let stale = db.get(&key).await.unwrap().unwrap();
        db.advance(&key, Status::Extracted, t0(), None).await.unwrap();

        let err = StageError::transient("vision timed out");
        let result = db
            .compare_and_set(&stale, Status::Failed, t0(), Some(&err), &Artifacts::default())
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::InvalidTransition {
                from: Status::Extracted,
                to: Status::Failed,
                ..
            })
        ));

        let row = db.get(&key).await.unwrap().unwrap();
        assert_eq!(row.status, Status::Extracted);
        assert!(row.error_detail.is_none());
        assert!(row.failed_at.is_none());
    }

    // ── Failure and retry ───────────────────────────────────────────

    #[tokio::test]
    async fn failure_records_detail_and_origin() {
        let db = test_db().await;
        let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;
        db.advance(&key, Status::Downloaded, t0(), None).await.unwrap();

        let err = StageError::transient("rate limited");
        let row = db
            .advance(&key, Status::Failed, t0(), Some(&err))
            .await
            .unwrap();

        assert_eq!(row.status, Status::Failed);
        assert_eq!(row.failed_from, Some(Status::Downloaded));
        assert_eq!(row.failure_kind, Some(FailureKind::Transient));
        assert!(row.retryable);
        assert_eq!(row.error_detail.as_deref(), Some("rate limited"));
        assert_eq!(row.failed_at, Some(t0()));
    }

    #[tokio::test]
    async fn successful_retry_clears_error_detail() {
        let db = test_db().await;
        let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;
        db.advance(&key, Status::Downloaded, t0(), None).await.unwrap();
        db.advance(
            &key,
            Status::Failed,
            t0(),
            Some(&StageError::transient("timeout")),
        )
        .await
        .unwrap();

        let row = db
            .advance(&key, Status::Extracted, t0() + Duration::hours(1), None)
            .await
            .unwrap();
        assert_eq!(row.status, Status::Extracted);
        assert!(row.error_detail.is_none());
        assert!(row.failure_kind.is_none());
        assert_eq!(
            row.stage_timestamps.extracted_at,
            Some(t0() + Duration::hours(1))
        );
    }

    #[tokio::test]
    async fn repeated_failure_keeps_original_stage() {
        let db = test_db().await;
        let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;
        db.advance(&key, Status::Downloaded, t0(), None).await.unwrap();
        let err = StageError::transient("timeout");
        db.advance(&key, Status::Failed, t0(), Some(&err)).await.unwrap();
        let row = db
            .advance(&key, Status::Failed, t0(), Some(&err))
            .await
            .unwrap();
        assert_eq!(row.failed_from, Some(Status::Downloaded));
    }

    #[tokio::test]
    async fn converted_rows_cannot_fail() {
        let db = test_db().await;
        let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;
        for status in [Status::Downloaded, Status::Extracted, Status::Converted] {
            db.advance(&key, status, t0(), None).await.unwrap();
        }
        let err = db
            .advance(
                &key,
                Status::Failed,
                t0(),
                Some(&StageError::content("late failure")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn rearm_makes_validation_failure_pending_again() {
        let db = test_db().await;
        let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;
        for status in [Status::Downloaded, Status::Extracted] {
            db.advance(&key, status, t0(), None).await.unwrap();
        }
        db.advance(
            &key,
            Status::Failed,
            t0(),
            Some(&StageError::missing_fields(&["amount".into()])),
        )
        .await
        .unwrap();

        assert!(db.next_pending(Stage::Convert, 0).await.unwrap().is_none());

        let row = db.rearm(&key).await.unwrap();
        assert!(row.retryable);
        let pending = db.next_pending(Stage::Convert, 0).await.unwrap().unwrap();
        assert_eq!(pending.key, key);
    }

    #[tokio::test]
    async fn rearm_rejects_rows_that_are_not_failed() {
        let db = test_db().await;
        let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;
        assert!(matches!(
            db.rearm(&key).await,
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    // ── Pending scans ───────────────────────────────────────────────

    #[tokio::test]
    async fn rows_pending_yields_only_stage_precondition() {
        let db = test_db().await;
        let a = insert(&db, &make_row("A", "a.pdf", "h1")).await.key;
        let b = insert(&db, &make_row("B", "b.pdf", "h2")).await.key;
        insert(&db, &make_row("C", "c.pdf", "h3")).await;
        db.advance(&a, Status::Downloaded, t0(), None).await.unwrap();
        db.advance(&b, Status::Downloaded, t0(), None).await.unwrap();
        db.advance(&b, Status::Extracted, t0(), None).await.unwrap();

        let pending: Vec<LedgerRow> = db
            .rows_pending(Stage::Extract)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, a);
    }

    #[tokio::test]
    async fn rows_pending_reads_state_lazily() {
        let db = test_db().await;
        let a = insert(&db, &make_row("A", "a.pdf", "h1")).await.key;
        let b = insert(&db, &make_row("B", "b.pdf", "h2")).await.key;
        db.advance(&a, Status::Downloaded, t0(), None).await.unwrap();

        let mut stream = db.rows_pending(Stage::Extract);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.key, a);

        // Committed after the scan started, still ahead of the cursor
        db.advance(&b, Status::Downloaded, t0(), None).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.key, b);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn rows_pending_skips_non_retryable_failures() {
        let db = test_db().await;
        let a = insert(&db, &make_row("A", "a.pdf", "h1")).await.key;
        let b = insert(&db, &make_row("B", "b.pdf", "h2")).await.key;
        for key in [&a, &b] {
            db.advance(key, Status::Downloaded, t0(), None).await.unwrap();
        }
        db.advance(&a, Status::Failed, t0(), Some(&StageError::transient("503")))
            .await
            .unwrap();
        db.advance(
            &b,
            Status::Failed,
            t0(),
            Some(&StageError::content("encrypted pdf")),
        )
        .await
        .unwrap();

        let pending: Vec<LedgerRow> = db
            .rows_pending(Stage::Extract)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, a);
    }

    #[tokio::test]
    async fn row_failed_during_scan_is_not_revisited() {
        let db = test_db().await;
        let a = insert(&db, &make_row("A", "a.pdf", "h1")).await.key;
        db.advance(&a, Status::Downloaded, t0(), None).await.unwrap();

        let mut stream = db.rows_pending(Stage::Extract);
        let row = stream.next().await.unwrap().unwrap();
        db.advance(
            &row.key,
            Status::Failed,
            t0(),
            Some(&StageError::transient("timeout")),
        )
        .await
        .unwrap();
        assert!(stream.next().await.is_none());

        // A fresh scan picks it up again
        let again: Vec<_> = db.rows_pending(Stage::Extract).collect().await;
        assert_eq!(again.len(), 1);
    }

    // ── Lookups and summary ─────────────────────────────────────────

    #[tokio::test]
    async fn path_in_use_and_find_by_hash() {
        let db = test_db().await;
        let row = insert(&db, &make_row("A", "quote.pdf", "h1")).await;

        assert!(db.path_in_use(&row.stored_path).await.unwrap());
        assert!(!db.path_in_use("download/other.pdf").await.unwrap());
        assert_eq!(db.find_by_hash("h1").await.unwrap().unwrap().key, row.key);
        assert!(db.find_by_hash("h9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn summary_counts_statuses_and_uniques() {
        let db = test_db().await;
        let a = insert(&db, &make_row("A", "a.pdf", "h1")).await.key;
        insert(&db, &make_row("B", "b.png", "h2")).await;
        db.advance(&a, Status::Downloaded, t0(), None).await.unwrap();

        let summary = db.summary(1).await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.count(Status::Downloaded), 1);
        assert_eq!(summary.count(Status::Discovered), 1);
        assert_eq!(summary.count(Status::Failed), 0);
        assert_eq!(summary.unique_sources, 2);
        assert_eq!(summary.unique_senders, 1);
        assert_eq!(summary.by_extension.get("pdf"), Some(&1));
        assert_eq!(summary.by_extension.get("png"), Some(&1));
        assert_eq!(summary.recent.len(), 1);
        assert_eq!(summary.recent[0].key.source_id, "B");
    }

    #[tokio::test]
    async fn corrupt_timestamp_is_a_query_error() {
        let db = test_db().await;
        let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;
        db.advance(&key, Status::Downloaded, t0(), None).await.unwrap();
        db.conn()
            .execute("UPDATE ledger SET downloaded_at = 'garbage'", ())
            .await
            .unwrap();

        let err = db.get(&key).await.unwrap_err();
        match err {
            LedgerError::Database(DatabaseError::Query(msg)) => {
                assert!(msg.contains("downloaded_at"), "{msg}");
                assert!(msg.contains("garbage"), "{msg}");
            }
            other => panic!("expected a query error, got {other:?}"),
        }
    }

    #[test]
    fn sqlite_datetime_formats_parse() {
        let dt = parse_datetime("2025-01-01 09:00:00", "created_at").unwrap();
        assert_eq!(dt, t0());
        let dt = parse_datetime("2025-01-01 09:00:00.000", "created_at").unwrap();
        assert_eq!(dt, t0());
        assert!(parse_datetime("", "created_at").is_err());
    }

    #[tokio::test]
    async fn local_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("ledger.db");
        {
            let db = LibSqlLedger::new_local(&path).await.unwrap();
            let key = insert(&db, &make_row("A", "quote.pdf", "h1")).await.key;
            db.advance(&key, Status::Downloaded, t0(), None).await.unwrap();
        }

        let db = LibSqlLedger::new_local(&path).await.unwrap();
        let rows = db.list_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, Status::Downloaded);
    }
}
