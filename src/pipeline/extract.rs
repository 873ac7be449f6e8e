//! Extract: render each downloaded document to page images and transcribe
//! them with the vision model into one Markdown artifact.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{Error, StageError};
use crate::llm::VisionModel;
use crate::pipeline::stage::{StageRunner, commit};
use crate::pipeline::types::{ItemOutcome, Outcome, RunReport};
use crate::rasterize::Rasterizer;
use crate::store::{Artifacts, Ledger, LedgerRow, Stage};
use crate::workspace::Workspace;

/// Instructions sent with every page image.
pub const EXTRACTION_INSTRUCTIONS: &str = "\
Extract ALL content from this page image.

1. Free text: reproduce every heading, paragraph, label and value exactly as written.
2. Tables: render each table as a Markdown table, keeping every row and column. \
Use an empty cell where a cell is blank.
3. Checkboxes: write [x] for checked and [ ] for unchecked boxes, followed by their label.
4. Radio buttons: write (•) for the selected option and ( ) for the others.
5. Handwriting or unclear text: transcribe your best reading and add \
<!-- uncertain: reason --> right after it.

Return only the Markdown content of the page, with no commentary.";

pub struct ExtractStage {
    ledger: Arc<dyn Ledger>,
    rasterizer: Arc<dyn Rasterizer>,
    vision: Arc<dyn VisionModel>,
    workspace: Workspace,
}

impl ExtractStage {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        rasterizer: Arc<dyn Rasterizer>,
        vision: Arc<dyn VisionModel>,
        workspace: Workspace,
    ) -> Self {
        Self {
            ledger,
            rasterizer,
            vision,
            workspace,
        }
    }

    async fn extract(&self, row: &LedgerRow) -> Result<Artifacts, StageError> {
        if !self.workspace.exists(&row.stored_path).await {
            return Err(StageError::content(format!(
                "downloaded file missing: {}",
                row.stored_path
            )));
        }
        let document = self.workspace.resolve_path(&row.stored_path);

        let scratch = self.workspace.create_scratch_dir(&row.content_hash).await?;
        let text = self.transcribe(&document, &scratch).await;
        if let Err(e) = self.workspace.remove_scratch_dir(&scratch).await {
            warn!(dir = %scratch.display(), error = %e, "Failed to remove page images");
        }
        let text = text?;

        let text_path = Workspace::output_path(&row.stored_path);
        self.workspace.write(&text_path, text.as_bytes()).await?;
        Ok(Artifacts {
            text_path: Some(text_path),
            ..Default::default()
        })
    }

    async fn transcribe(&self, document: &Path, scratch: &Path) -> Result<String, StageError> {
        let pages = self.rasterizer.rasterize(document, scratch).await?;
        debug!(document = %document.display(), pages = pages.len(), "Document rasterized");

        let mut blocks = Vec::with_capacity(pages.len());
        for page in &pages {
            let image = tokio::fs::read(&page.path).await?;
            let text = self
                .vision
                .extract_page(&image, page.media_type, EXTRACTION_INSTRUCTIONS)
                .await?;
            blocks.push(page_block(page.number, &strip_code_fences(&text)));
        }
        Ok(blocks.join("\n"))
    }
}

/// One page of the text artifact.
pub fn page_block(number: usize, text: &str) -> String {
    format!("## Page {number}\n\n{text}\n\n---\n")
}

/// Remove a Markdown code fence wrapped around the whole response.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the info string (```markdown) along with the opening fence.
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
        .to_string()
}

#[async_trait]
impl StageRunner for ExtractStage {
    fn stage(&self) -> Stage {
        Stage::Extract
    }

    async fn run(&self, report: &mut RunReport) -> Result<(), Error> {
        info!(model = self.vision.model_name(), "Extracting downloaded documents");

        let mut pending = self.ledger.rows_pending(Stage::Extract);
        while let Some(row) = pending.next().await {
            let row = row?;
            let result = self.extract(&row).await;
            let outcome = commit(self.ledger.as_ref(), Stage::Extract, &row.key, result).await?;

            match &outcome {
                Outcome::Succeeded => info!(key = %row.key, name = %row.attachment_name, "Extracted"),
                Outcome::Failed { kind, error } => warn!(
                    key = %row.key,
                    name = %row.attachment_name,
                    kind = kind.as_str(),
                    error = %error,
                    "Extraction failed"
                ),
                Outcome::Skipped(_) => {}
            }
            report.record(ItemOutcome {
                stage: Stage::Extract,
                key: row.key.clone(),
                attachment_name: row.attachment_name.clone(),
                outcome,
            });
        }

        let counts = report.counts(Stage::Extract);
        info!(
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            "Extract complete"
        );
        Ok(())
    }
}
