//! Fetch: claim new attachments in the Ledger and store their bytes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{Error, FailureKind, LedgerError, StageError};
use crate::fingerprint::{fingerprint, fingerprint_metadata};
use crate::pipeline::stage::{StageRunner, commit};
use crate::pipeline::types::{ItemOutcome, Outcome, RunReport, SkipReason};
use crate::source::{Attachment, MailSource, SourceItem};
use crate::store::{Artifacts, ItemKey, Ledger, LedgerRow, NewRow, Stage, UpsertOutcome};
use crate::workspace::Workspace;

/// Upper bound on `_N` suffixes tried for one attachment name.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

pub struct FetchStage {
    ledger: Arc<dyn Ledger>,
    source: Arc<dyn MailSource>,
    workspace: Workspace,
    config: PipelineConfig,
}

impl FetchStage {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        source: Arc<dyn MailSource>,
        workspace: Workspace,
        config: PipelineConfig,
    ) -> Self {
        Self {
            ledger,
            source,
            workspace,
            config,
        }
    }

    async fn fetch_attachment(
        &self,
        item: &SourceItem,
        attachment: &Attachment,
    ) -> Result<Outcome, LedgerError> {
        let key = ItemKey::new(&item.source_id, &attachment.id);

        if let Some(row) = self.ledger.get(&key).await? {
            if row.is_pending_for(Stage::Fetch) {
                debug!(key = %key, status = %row.status, "Resuming unfinished download");
                return self.store_bytes(&row, attachment).await;
            }
            return Ok(Outcome::Skipped(SkipReason::AlreadyKnown { status: row.status }));
        }

        let content_hash = fingerprint(&attachment.bytes);
        if let Some(existing) = self.ledger.find_by_hash(&content_hash).await? {
            return Ok(Outcome::Skipped(SkipReason::Duplicate {
                existing: existing.key,
            }));
        }

        let Some(stored_path) = self.pick_stored_path(&attachment.name).await? else {
            // Nothing claimed yet, so there is no row to fail.
            return Ok(Outcome::Failed {
                kind: FailureKind::Io,
                error: format!("no free download name for '{}'", attachment.name),
            });
        };

        let now = Utc::now();
        let new_row = NewRow {
            key,
            thread_id: item.thread_id.clone(),
            sender: item.sender.clone(),
            subject: item.subject.clone(),
            received_at: item.received_at,
            attachment_name: attachment.name.clone(),
            stored_path,
            content_hash,
            message_hash: fingerprint_metadata(
                &item.sender,
                &item.subject,
                &item.thread_id,
                item.received_at,
            ),
            discovered_at: now,
        };

        match self.ledger.upsert(&new_row).await? {
            UpsertOutcome::Inserted(row) => self.store_bytes(&row, attachment).await,
            UpsertOutcome::Duplicate { existing } => Ok(Outcome::Skipped(SkipReason::Duplicate {
                existing: existing.key,
            })),
        }
    }

    /// Write the attachment to the row's stored path and mark it downloaded.
    async fn store_bytes(
        &self,
        row: &LedgerRow,
        attachment: &Attachment,
    ) -> Result<Outcome, LedgerError> {
        let result = if fingerprint(&attachment.bytes) != row.content_hash {
            Err(StageError::content(
                "attachment bytes changed since the row was discovered",
            ))
        } else {
            self.workspace
                .write(&row.stored_path, &attachment.bytes)
                .await
                .map(|()| Artifacts::default())
                .map_err(StageError::from)
        };
        commit(self.ledger.as_ref(), Stage::Fetch, &row.key, result).await
    }

    /// First `download/` name free both on disk and in the Ledger.
    async fn pick_stored_path(&self, name: &str) -> Result<Option<String>, LedgerError> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = Workspace::download_candidate(name, attempt);
            if self.workspace.exists(&candidate).await {
                continue;
            }
            if self.ledger.path_in_use(&candidate).await? {
                continue;
            }
            return Ok(Some(candidate));
        }
        Ok(None)
    }
}

#[async_trait]
impl StageRunner for FetchStage {
    fn stage(&self) -> Stage {
        Stage::Fetch
    }

    async fn run(&self, report: &mut RunReport) -> Result<(), Error> {
        let items = match self.source.list_unprocessed_items().await {
            Ok(items) => items,
            Err(e) => {
                // Nothing was claimed; the next run lists the source again.
                error!(source = self.source.name(), error = %e, "Failed to list source items");
                return Ok(());
            }
        };
        info!(
            source = self.source.name(),
            count = items.len(),
            "Fetching attachments"
        );

        for item in &items {
            for attachment in &item.attachments {
                if !self.config.is_allowed_extension(&attachment.name) {
                    debug!(
                        source_id = %item.source_id,
                        name = %attachment.name,
                        "Ignoring attachment with disallowed extension"
                    );
                    continue;
                }

                let outcome = self.fetch_attachment(item, attachment).await?;
                match &outcome {
                    Outcome::Succeeded => {
                        info!(source_id = %item.source_id, name = %attachment.name, "Downloaded")
                    }
                    Outcome::Failed { error, .. } => {
                        warn!(source_id = %item.source_id, name = %attachment.name, error = %error, "Download failed")
                    }
                    Outcome::Skipped(SkipReason::Duplicate { existing }) => {
                        info!(source_id = %item.source_id, name = %attachment.name, existing = %existing, "Duplicate content, skipped")
                    }
                    Outcome::Skipped(_) => {}
                }
                report.record(ItemOutcome {
                    stage: Stage::Fetch,
                    key: ItemKey::new(&item.source_id, &attachment.id),
                    attachment_name: attachment.name.clone(),
                    outcome,
                });
            }
        }

        let counts = report.counts(Stage::Fetch);
        info!(
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            "Fetch complete"
        );
        Ok(())
    }
}
