//! Stage runners and the orchestrator that drives them.
//!
//! Every item moves through the same three stages:
//! 1. `FetchStage`: claim the attachment by content hash and store its bytes
//! 2. `ExtractStage`: rasterize and transcribe pages into a Markdown artifact
//! 3. `ConvertStage`: classify the text and write a validated JSON record
//!
//! A stage acts only on rows holding its precondition status, so any stage
//! can be re-run at any time without repeating work.

pub mod convert;
pub mod extract;
pub mod fetch;
pub mod orchestrator;
pub mod stage;
pub mod text_stats;
pub mod types;

pub use convert::ConvertStage;
pub use extract::{EXTRACTION_INSTRUCTIONS, ExtractStage};
pub use fetch::FetchStage;
pub use orchestrator::Pipeline;
pub use stage::StageRunner;
pub use text_stats::TextStats;
pub use types::{ItemOutcome, Outcome, RunReport, SkipReason, StageCounts};
