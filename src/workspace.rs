//! File-backed workspace for pipeline artifacts.
//!
//! The workspace is a directory on disk containing:
//! - Raw attachments: download/<name>
//! - Extracted page text: output/<stored name>.md
//! - Structured records: results/<stem>_<YYYYmmdd_HHMMSS>.json
//! - Per-item page images: images/<hash>-<uuid>/ (removed after extraction,
//!   or at startup if a crashed run left them behind)
//!
//! Paths handed to the Ledger are relative to the workspace root.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::info;

use crate::error::WorkspaceError;

/// Well-known workspace directories.
pub mod paths {
    pub const DOWNLOAD: &str = "download";
    pub const OUTPUT: &str = "output";
    pub const RESULTS: &str = "results";
    pub const IMAGES: &str = "images";
}

const LAYOUT: &[&str] = &[paths::DOWNLOAD, paths::OUTPUT, paths::RESULTS, paths::IMAGES];

/// Page-image directories untouched for this long belong to a dead invocation.
/// Younger ones may still be in use by a concurrent run.
const STALE_SCRATCH_AGE: Duration = Duration::from_secs(6 * 60 * 60);

/// File-backed workspace rooted at the pipeline base directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    base_path: PathBuf,
}

impl Workspace {
    /// Create a new workspace rooted at `base_path`.
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a relative workspace path to an absolute path.
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        self.base_path.join(relative)
    }

    /// Ensure the workspace directory structure exists.
    /// Create the directory layout and clear out stale page-image directories.
    pub async fn ensure_dirs(&self) -> Result<(), WorkspaceError> {
        for dir in LAYOUT {
            fs::create_dir_all(self.base_path.join(dir)).await?;
        }
        let removed = self.sweep_scratch(STALE_SCRATCH_AGE).await?;
        if removed > 0 {
            info!(removed, "Removed stale page-image directories");
        }
        Ok(())
    }

    /// Remove scratch directories last modified at least `max_age` ago.
    pub async fn sweep_scratch(&self, max_age: Duration) -> Result<usize, WorkspaceError> {
        let mut removed = 0;
        let mut entries = fs::read_dir(self.base_path.join(paths::IMAGES)).await?;
        while let Some(entry) = entries.next_entry().await? {
            // Another invocation may remove it first.
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_dir() {
                continue;
            }
            let age = meta.modified()?.elapsed().unwrap_or_default();
            if age >= max_age {
                self.remove_scratch_dir(&entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn exists(&self, path: &str) -> bool {
        fs::try_exists(self.resolve_path(path))
            .await
            .unwrap_or(false)
    }

    /// Read a file from the workspace.
    pub async fn read(&self, path: &str) -> Result<String, WorkspaceError> {
        let bytes = self.read_bytes(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, WorkspaceError> {
        let full_path = self.resolve_path(path);
        match fs::read(&full_path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(WorkspaceError::FileNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write (overwrite) a file in the workspace.
    ///
    /// Content goes to a sibling temporary file first and is renamed into
    /// place, so readers never see a half-written artifact.
    pub async fn write(&self, path: &str, content: &[u8]) -> Result<(), WorkspaceError> {
        let full_path = self.resolve_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = full_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact");
        let tmp_path = full_path.with_file_name(format!(".{file_name}.part"));
        fs::write(&tmp_path, content).await?;
        if let Err(e) = fs::rename(&tmp_path, &full_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    // ── Naming ──────────────────────────────────────────────────────

    /// Download path for the `attempt`-th candidate of `name`.
    ///
    /// Attempt 0 is the sanitized name itself; later attempts add `_1`,
    /// `_2`, … before the extension.
    pub fn download_candidate(name: &str, attempt: u32) -> String {
        let clean = sanitize_file_name(name);
        let file = if attempt == 0 {
            clean
        } else {
            let (stem, ext) = split_name(&clean);
            match ext {
                Some(ext) => format!("{stem}_{attempt}.{ext}"),
                None => format!("{stem}_{attempt}"),
            }
        };
        format!("{}/{file}", paths::DOWNLOAD)
    }

    /// Intermediate text artifact for a stored attachment.
    pub fn output_path(stored_path: &str) -> String {
        format!("{}/{}.md", paths::OUTPUT, file_name_of(stored_path))
    }

    /// Final record path named after the stored file and the processing time.
    ///
    /// Falls back to `_1`, `_2`, … when two records land in the same second.
    pub async fn unique_result_path(
        &self,
        stored_path: &str,
        at: DateTime<Utc>,
    ) -> Result<String, WorkspaceError> {
        let (stem, _) = split_name(file_name_of(stored_path));
        let stamp = at.format("%Y%m%d_%H%M%S");
        let mut candidate = format!("{}/{stem}_{stamp}.json", paths::RESULTS);
        let mut attempt = 1;
        while self.exists(&candidate).await {
            candidate = format!("{}/{stem}_{stamp}_{attempt}.json", paths::RESULTS);
            attempt += 1;
        }
        Ok(candidate)
    }

    // ── Scratch space ───────────────────────────────────────────────

    /// Fresh per-item directory for rendered page images.
    pub async fn create_scratch_dir(&self, content_hash: &str) -> Result<PathBuf, WorkspaceError> {
        let prefix: String = content_hash.chars().take(16).collect();
        let dir = self
            .base_path
            .join(paths::IMAGES)
            .join(format!("{prefix}-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Remove a scratch directory. Missing directories are not an error.
    pub async fn remove_scratch_dir(&self, dir: &Path) -> Result<(), WorkspaceError> {
        match fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Make an attachment name safe to use as a single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "attachment".to_string()
    } else {
        trimmed.to_string()
    }
}

fn file_name_of(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Split `name.ext` into stem and extension.
fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn test_workspace() -> (Workspace, TempDir) {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().to_path_buf());
        ws.ensure_dirs().await.unwrap();
        (ws, dir)
    }

    #[tokio::test]
    async fn ensure_dirs_creates_layout() {
        let (_ws, dir) = test_workspace().await;
        for sub in LAYOUT {
            assert!(dir.path().join(sub).is_dir(), "{sub} should exist");
        }
    }

    #[tokio::test]
    async fn write_read_roundtrip_leaves_no_temp_file() {
        let (ws, dir) = test_workspace().await;
        ws.write("output/a.pdf.md", b"## Page 1").await.unwrap();
        assert_eq!(ws.read("output/a.pdf.md").await.unwrap(), "## Page 1");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("output"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn read_missing_is_file_not_found() {
        let (ws, _dir) = test_workspace().await;
        let result = ws.read_bytes("download/nope.pdf").await;
        assert!(matches!(result, Err(WorkspaceError::FileNotFound(_))));
    }

    #[test]
    fn download_candidates_add_suffix_before_extension() {
        assert_eq!(Workspace::download_candidate("quote.pdf", 0), "download/quote.pdf");
        assert_eq!(Workspace::download_candidate("quote.pdf", 2), "download/quote_2.pdf");
        assert_eq!(Workspace::download_candidate("README", 1), "download/README_1");
    }

    #[test]
    fn sanitize_strips_path_components() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("a\\b.pdf"), "a_b.pdf");
        assert_eq!(sanitize_file_name("   "), "attachment");
        assert_eq!(sanitize_file_name(".hidden.pdf"), "hidden.pdf");
    }

    #[test]
    fn output_path_keeps_stored_name() {
        assert_eq!(
            Workspace::output_path("download/quote_1.pdf"),
            "output/quote_1.pdf.md"
        );
    }

    #[tokio::test]
    async fn result_path_is_timestamped_and_collision_free() {
        let (ws, _dir) = test_workspace().await;
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 9, 30, 5).unwrap();

        let first = ws.unique_result_path("download/quote.pdf", at).await.unwrap();
        assert_eq!(first, "results/quote_20250101_093005.json");

        ws.write(&first, b"{}").await.unwrap();
        let second = ws.unique_result_path("download/quote.pdf", at).await.unwrap();
        assert_eq!(second, "results/quote_20250101_093005_1.json");
    }

    #[tokio::test]
    async fn scratch_dirs_are_unique_and_removable() {
        let (ws, _dir) = test_workspace().await;
        let a = ws.create_scratch_dir("abcdef").await.unwrap();
        let b = ws.create_scratch_dir("abcdef").await.unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir());

        ws.remove_scratch_dir(&a).await.unwrap();
        assert!(!a.exists());
        // Second removal is a no-op
        ws.remove_scratch_dir(&a).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_removes_leftover_page_images() {
        let (ws, dir) = test_workspace().await;
        let leftover = dir.path().join("images").join("abc-123");
        std::fs::create_dir_all(&leftover).unwrap();
        std::fs::write(leftover.join("page-1.png"), b"png").unwrap();
        std::fs::write(dir.path().join("images").join("stray.txt"), b"x").unwrap();

        assert_eq!(ws.sweep_scratch(Duration::ZERO).await.unwrap(), 1);
        assert!(!leftover.exists());
        // Plain files are not scratch directories
        assert!(dir.path().join("images").join("stray.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ensure_dirs_clears_stale_scratch_but_keeps_fresh() {
        let (ws, dir) = test_workspace().await;
        let stale = dir.path().join("images").join("abc-123");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::File::open(&stale)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(24 * 60 * 60))
            .unwrap();
        let fresh = ws.create_scratch_dir("def456").await.unwrap();

        ws.ensure_dirs().await.unwrap();
        assert!(!stale.exists());
        assert!(fresh.is_dir());
    }
}
