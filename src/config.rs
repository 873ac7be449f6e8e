//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;

/// Extensions accepted as pipeline items when none are configured.
pub const DEFAULT_EXTENSIONS: &[&str] = &["pdf", "png", "jpg", "jpeg", "webp"];

/// Rendering resolution for PDF pages.
pub const DEFAULT_RENDER_DPI: u32 = 300;

/// Pipeline configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the download/output/results layout.
    pub base_dir: PathBuf,
    /// Ledger database file.
    pub db_path: PathBuf,
    /// Lowercased attachment extensions that become pipeline items.
    pub allowed_extensions: Vec<String>,
    pub render_dpi: u32,
    /// JSON schema definitions replacing the built-in registry.
    pub schemas_path: Option<PathBuf>,
    /// Directory for the daily rolling log file. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let base_dir = PathBuf::from(".");
        Self {
            db_path: base_dir.join("data").join("ledger.db"),
            base_dir,
            allowed_extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            render_dpi: DEFAULT_RENDER_DPI,
            schemas_path: None,
            log_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_dir = std::env::var("PIPELINE_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let db_path = std::env::var("PIPELINE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join("data").join("ledger.db"));

        let allowed_extensions = match std::env::var("PIPELINE_ALLOWED_EXTENSIONS") {
            Ok(raw) => parse_extensions(&raw),
            Err(_) => DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        };
        if allowed_extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "PIPELINE_ALLOWED_EXTENSIONS".into(),
                message: "at least one extension is required".into(),
            });
        }

        let render_dpi: u32 = env_parse("PIPELINE_RENDER_DPI", DEFAULT_RENDER_DPI)?;
        if render_dpi == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PIPELINE_RENDER_DPI".into(),
                message: "must be positive".into(),
            });
        }

        Ok(Self {
            base_dir,
            db_path,
            allowed_extensions,
            render_dpi,
            schemas_path: std::env::var("PIPELINE_SCHEMAS_PATH").ok().map(PathBuf::from),
            log_dir: std::env::var("PIPELINE_LOG_DIR").ok().map(PathBuf::from),
        })
    }

    /// Whether `file_name` carries one of the allowed extensions.
    pub fn is_allowed_extension(&self, file_name: &str) -> bool {
        std::path::Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.allowed_extensions.iter().any(|a| *a == ext)
            })
    }
}

/// Split a comma-separated extension list, dropping dots and blanks.
pub fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Read and parse an optional environment variable.
pub(crate) fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
