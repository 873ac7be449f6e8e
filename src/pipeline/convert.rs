//! Convert: classify extracted text and write a validated structured record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, StageError};
use crate::pipeline::stage::{StageRunner, commit};
use crate::pipeline::text_stats::TextStats;
use crate::pipeline::types::{ItemOutcome, Outcome, RunReport, SkipReason};
use crate::schema::SchemaRegistry;
use crate::store::{Artifacts, Ledger, LedgerRow, Stage};
use crate::workspace::Workspace;

/// The structured record written to `results/`.
#[derive(Debug, Serialize)]
pub struct ResultRecord<'a> {
    pub status: &'static str,
    pub schema_id: &'a str,
    pub source_id: &'a str,
    pub attachment_id: &'a str,
    pub content_hash: &'a str,
    pub file_path: &'a str,
    pub data: &'a Map<String, Value>,
}

pub struct ConvertStage {
    ledger: Arc<dyn Ledger>,
    registry: Arc<dyn SchemaRegistry>,
    workspace: Workspace,
}

impl ConvertStage {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        registry: Arc<dyn SchemaRegistry>,
        workspace: Workspace,
    ) -> Self {
        Self {
            ledger,
            registry,
            workspace,
        }
    }

    async fn convert(&self, row: &LedgerRow) -> Result<Artifacts, StageError> {
        let text_path = row
            .text_path
            .clone()
            .unwrap_or_else(|| Workspace::output_path(&row.stored_path));
        let text = self.workspace.read(&text_path).await?;
        if text.trim().is_empty() {
            return Err(StageError::validation("extracted text is empty"));
        }

        let stats = TextStats::from_markdown(&text);
        debug!(
            key = %row.key,
            chars = stats.chars,
            headers = stats.headers,
            sections = stats.sections,
            checked = stats.checked_boxes,
            unchecked = stats.unchecked_boxes,
            radio = stats.radio_selections,
            table_lines = stats.table_lines,
            "Text statistics"
        );

        let schema_id = self.registry.classify(&text).await?;
        debug!(key = %row.key, schema = %schema_id, "Classified");
        let data = self.registry.extract_fields(&text, &schema_id).await?;

        let record = ResultRecord {
            status: "success",
            schema_id: &schema_id,
            source_id: &row.key.source_id,
            attachment_id: &row.key.attachment_id,
            content_hash: &row.content_hash,
            file_path: &row.stored_path,
            data: &data,
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| StageError::validation(format!("unserializable record: {e}")))?;

        let result_path = self
            .workspace
            .unique_result_path(&row.stored_path, Utc::now())
            .await?;
        self.workspace.write(&result_path, &json).await?;

        Ok(Artifacts {
            result_path: Some(result_path),
            schema_id: Some(schema_id),
            ..Default::default()
        })
    }

    /// Remove a record written by a run that then lost the row to another run.
    async fn discard_record(&self, result_path: &str) {
        let path = self.workspace.resolve_path(result_path);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove orphaned record");
        }
    }
}

#[async_trait]
impl StageRunner for ConvertStage {
    fn stage(&self) -> Stage {
        Stage::Convert
    }

    async fn run(&self, report: &mut RunReport) -> Result<(), Error> {
        info!("Converting extracted documents");

        let mut pending = self.ledger.rows_pending(Stage::Convert);
        while let Some(row) = pending.next().await {
            let row = row?;
            let result = self.convert(&row).await;
            let written = result
                .as_ref()
                .ok()
                .and_then(|a| a.result_path.clone());
            let outcome = commit(self.ledger.as_ref(), Stage::Convert, &row.key, result).await?;

            match &outcome {
                Outcome::Succeeded => info!(key = %row.key, name = %row.attachment_name, "Converted"),
                Outcome::Failed { kind, error } => warn!(
                    key = %row.key,
                    name = %row.attachment_name,
                    kind = kind.as_str(),
                    error = %error,
                    "Conversion failed"
                ),
                Outcome::Skipped(SkipReason::LostRace) => {
                    if let Some(path) = written {
                        self.discard_record(&path).await;
                    }
                }
                Outcome::Skipped(_) => {}
            }
            report.record(ItemOutcome {
                stage: Stage::Convert,
                key: row.key.clone(),
                attachment_name: row.attachment_name.clone(),
                outcome,
            });
        }

        let counts = report.counts(Stage::Convert);
        info!(
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            "Convert complete"
        );
        Ok(())
    }
}
