//! The template every stage runner follows.

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::error::{Error, LedgerError, StageError};
use crate::pipeline::types::{Outcome, RunReport, SkipReason};
use crate::store::{Artifacts, ItemKey, Ledger, Stage, Status};

/// One forward transition applied to every row that is pending for it.
#[async_trait]
pub trait StageRunner: Send + Sync {
    fn stage(&self) -> Stage;

    /// Process the whole pending set, recording one outcome per item.
    ///
    /// Per-item failures are written to the Ledger and the report; only
    /// infrastructure errors (source listing aside) end the stage early.
    async fn run(&self, report: &mut RunReport) -> Result<(), Error>;
}

/// Write the result of one unit of work to the row.
///
/// Success advances to the stage's postcondition together with its
/// artifacts; a `StageError` moves the row to `failed`. Losing the
/// compare-and-set to another invocation is reported as a skip.
pub(crate) async fn commit(
    ledger: &dyn Ledger,
    stage: Stage,
    key: &ItemKey,
    result: Result<Artifacts, StageError>,
) -> Result<Outcome, LedgerError> {
    let now = Utc::now();
    let applied = match &result {
        Ok(artifacts) => {
            ledger
                .advance_with(key, stage.postcondition(), now, None, artifacts)
                .await
        }
        Err(err) => ledger.advance(key, Status::Failed, now, Some(err)).await,
    };

    match applied {
        Ok(_) => Ok(match result {
            Ok(_) => Outcome::Succeeded,
            Err(e) => Outcome::Failed {
                kind: e.kind,
                error: e.message,
            },
        }),
        Err(e @ (LedgerError::InvalidTransition { .. } | LedgerError::NotFound { .. })) => {
            warn!(key = %key, stage = %stage, error = %e, "Row changed underneath this run, skipping");
            Ok(Outcome::Skipped(SkipReason::LostRace))
        }
        Err(e) => Err(e),
    }
}
