//! Page rasterization: turns a stored document into ordered page images.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::RasterizeError;

/// One rendered page, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub number: usize,
    pub path: PathBuf,
    pub media_type: &'static str,
}

/// Splits a document into page images inside a caller-owned scratch directory.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn rasterize(
        &self,
        document: &Path,
        scratch_dir: &Path,
    ) -> Result<Vec<PageImage>, RasterizeError>;
}

/// Media type for an image extension the vision model accepts.
pub fn image_media_type(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

/// Poppler `pdftoppm` for PDFs; images pass through as a single page.
pub struct PdfToPpm {
    program: String,
    dpi: u32,
}

impl PdfToPpm {
    pub fn new(dpi: u32) -> Self {
        Self::with_program("pdftoppm", dpi)
    }

    pub fn with_program(program: impl Into<String>, dpi: u32) -> Self {
        Self {
            program: program.into(),
            dpi,
        }
    }

    async fn render_pdf(
        &self,
        document: &Path,
        scratch_dir: &Path,
    ) -> Result<Vec<PageImage>, RasterizeError> {
        // Failing to start the renderer surfaces as `Io`.
        let output = tokio::process::Command::new(&self.program)
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-png")
            .arg(document)
            .arg(scratch_dir.join("page"))
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RasterizeError::RendererFailed {
                program: self.program.clone(),
                reason: format!("exit {}: {}", output.status, stderr.trim()),
            });
        }

        let mut pages = Vec::new();
        let mut entries = fs::read_dir(scratch_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(number) = page_number(&name) {
                pages.push(PageImage {
                    number,
                    path: entry.path(),
                    media_type: "image/png",
                });
            }
        }
        pages.sort_by_key(|p| p.number);

        if pages.is_empty() {
            return Err(RasterizeError::Empty(document.display().to_string()));
        }
        tracing::debug!(
            document = %document.display(),
            pages = pages.len(),
            dpi = self.dpi,
            "PDF rendered"
        );
        Ok(pages)
    }
}

#[async_trait]
impl Rasterizer for PdfToPpm {
    async fn rasterize(
        &self,
        document: &Path,
        scratch_dir: &Path,
    ) -> Result<Vec<PageImage>, RasterizeError> {
        let ext = document
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if ext == "pdf" {
            return self.render_pdf(document, scratch_dir).await;
        }

        let Some(media_type) = image_media_type(&ext) else {
            return Err(RasterizeError::Unsupported(format!(
                "{} (extension '{ext}')",
                document.display()
            )));
        };
        let target = scratch_dir.join(format!("page-1.{ext}"));
        fs::copy(document, &target).await?;
        Ok(vec![PageImage {
            number: 1,
            path: target,
            media_type,
        }])
    }
}

/// Page number from a `pdftoppm` output name (`page-7.png`, `page-07.png`).
fn page_number(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix("page-")?
        .strip_suffix(".png")?
        .parse()
        .ok()
}
