//! Shared types for the stage runners: per-item outcomes and the run report.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::FailureKind;
use crate::store::{ItemKey, Stage, Status};

// ── Outcomes ────────────────────────────────────────────────────────

/// Why a stage did not act on an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Identical bytes already claimed by another row.
    Duplicate { existing: ItemKey },
    /// The item's row already exists past this stage's precondition.
    AlreadyKnown { status: Status },
    /// Another invocation advanced the row first.
    LostRace,
}

/// What happened to one item in one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed { kind: FailureKind, error: String },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub stage: Stage,
    pub key: ItemKey,
    pub attachment_name: String,
    pub outcome: Outcome,
}

impl fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({}): ", self.stage, self.key, self.attachment_name)?;
        match &self.outcome {
            Outcome::Succeeded => write!(f, "ok"),
            Outcome::Failed { kind, error } => write!(f, "FAILED ({}) {error}", kind.as_str()),
            Outcome::Skipped(SkipReason::Duplicate { existing }) => {
                write!(f, "duplicate of {existing}, skipped")
            }
            Outcome::Skipped(SkipReason::AlreadyKnown { status }) => {
                write!(f, "already known ({status}), skipped")
            }
            Outcome::Skipped(SkipReason::LostRace) => {
                write!(f, "advanced by another run, skipped")
            }
        }
    }
}

// ── Report ──────────────────────────────────────────────────────────

/// Succeeded/failed/skipped counts for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Aggregate result of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<ItemOutcome>,
    /// Rows whose `advance` lost a compare-and-set to another invocation.
    pub conflicts: usize,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            outcomes: Vec::new(),
            conflicts: 0,
        }
    }

    pub fn record(&mut self, outcome: ItemOutcome) {
        if outcome.outcome == Outcome::Skipped(SkipReason::LostRace) {
            self.conflicts += 1;
        }
        self.outcomes.push(outcome);
    }

    pub fn counts(&self, stage: Stage) -> StageCounts {
        let mut counts = StageCounts::default();
        for item in self.outcomes.iter().filter(|o| o.stage == stage) {
            match item.outcome {
                Outcome::Succeeded => counts.succeeded += 1,
                Outcome::Failed { .. } => counts.failed += 1,
                Outcome::Skipped(_) => counts.skipped += 1,
            }
        }
        counts
    }

    /// Outcomes worth showing a human: everything except "already known".
    pub fn notable(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes
            .iter()
            .filter(|o| !matches!(o.outcome, Outcome::Skipped(SkipReason::AlreadyKnown { .. })))
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}
