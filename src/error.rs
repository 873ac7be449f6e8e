//! Error types for the attachment pipeline.

use std::time::Duration;

use crate::store::traits::{ItemKey, Status};

/// Error that aborts a pipeline run.
///
/// Per-row failures never reach this type; they are recorded on the row.
/// What remains is the Ledger itself becoming unreadable or unwritable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Ledger contract errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The requested status does not directly follow the row's current one,
    /// or the row changed underneath the caller (lost compare-and-set).
    #[error("Row {key} is {from}, cannot transition to {to}")]
    InvalidTransition {
        key: ItemKey,
        from: Status,
        to: Status,
    },

    #[error("Row {key} not found")]
    NotFound { key: ItemKey },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Mail source errors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed for {user}")]
    AuthFailed { user: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Tagged `NO`: the server refused one command, the session is still usable.
    #[error("Server refused: {0}")]
    Rejected(String),

    #[error("Fetch task panicked: {0}")]
    Panicked(String),
}

/// LLM provider errors (vision and text).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether a later attempt can reasonably succeed without any change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RequestFailed { .. } | LlmError::RateLimited { .. }
        )
    }
}

/// Page rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum RasterizeError {
    #[error("Unsupported document type: {0}")]
    Unsupported(String),

    #[error("Renderer {program} failed: {reason}")]
    RendererFailed { program: String, reason: String },

    #[error("Document produced no pages: {0}")]
    Empty(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Schema registry errors.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Unknown schema: {0}")]
    UnknownSchema(String),

    #[error("No schema matches the document")]
    NoMatch,

    #[error("Model returned no usable JSON object")]
    NoJson,

    #[error("Missing or invalid fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("Invalid schema definition: {0}")]
    Definition(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Workspace (filesystem layout) errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),
}

/// How a per-row failure should be treated on the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network, quota, provider hiccup. Retried automatically.
    Transient,
    /// Local filesystem trouble. Retried automatically.
    Io,
    /// The document itself was rejected (unsupported, unreadable).
    Content,
    /// Structured output missing or malformed fields.
    Validation,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Io => "io",
            FailureKind::Content => "content",
            FailureKind::Validation => "validation",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::Io)
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transient" => Ok(FailureKind::Transient),
            "io" => Ok(FailureKind::Io),
            "content" => Ok(FailureKind::Content),
            "validation" => Ok(FailureKind::Validation),
            other => Err(format!("unknown failure kind: {other}")),
        }
    }
}

/// A failure while processing one row in one stage.
///
/// Recorded on the row via `advance(.., Status::Failed, ..)`; never aborts
/// the batch.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct StageError {
    pub kind: FailureKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn content(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Content, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    /// Missing or malformed structured fields, listed by name.
    pub fn missing_fields(fields: &[String]) -> Self {
        Self::validation(format!("missing or invalid fields: {}", fields.join(", ")))
    }
}

impl From<std::io::Error> for StageError {
    fn from(e: std::io::Error) -> Self {
        Self::new(FailureKind::Io, format!("IO error: {e}"))
    }
}

impl From<WorkspaceError> for StageError {
    fn from(e: WorkspaceError) -> Self {
        match e {
            WorkspaceError::Io(io) => io.into(),
            WorkspaceError::FileNotFound(path) => {
                Self::content(format!("artifact missing on disk: {path}"))
            }
        }
    }
}

impl From<LlmError> for StageError {
    fn from(e: LlmError) -> Self {
        let kind = if e.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::Content
        };
        Self::new(kind, e.to_string())
    }
}

impl From<RasterizeError> for StageError {
    fn from(e: RasterizeError) -> Self {
        match e {
            RasterizeError::Io(io) => io.into(),
            other => Self::content(other.to_string()),
        }
    }
}

impl From<SchemaError> for StageError {
    fn from(e: SchemaError) -> Self {
        match e {
            SchemaError::Llm(llm) => llm.into(),
            SchemaError::MissingFields(fields) => Self::missing_fields(&fields),
            SchemaError::Definition(reason) => {
                Self::validation(format!("schema definition: {reason}"))
            }
            other => Self::validation(other.to_string()),
        }
    }
}
