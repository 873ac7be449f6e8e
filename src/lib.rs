//! Attachment pipeline: idempotent, resumable processing of email attachments.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod llm;
pub mod pipeline;
pub mod rasterize;
pub mod schema;
pub mod source;
pub mod store;
pub mod workspace;
