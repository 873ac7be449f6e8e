//! Fixed-order pipeline: Fetch, then Extract, then Convert.
//!
//! Each stage drains its whole pending set before the next one starts, so a
//! later stage only ever sees rows an earlier stage has already committed.

use std::sync::Arc;

use tracing::{Instrument, info, info_span};

use crate::error::Error;
use crate::pipeline::stage::StageRunner;
use crate::pipeline::types::RunReport;
use crate::store::Stage;

#[derive(Default)]
pub struct Pipeline {
    runners: Vec<Arc<dyn StageRunner>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage runner. A second runner for the same stage replaces the first.
    pub fn with_stage(mut self, runner: Arc<dyn StageRunner>) -> Self {
        self.runners.retain(|r| r.stage() != runner.stage());
        self.runners.push(runner);
        self.runners.sort_by_key(|r| r.stage());
        self
    }

    /// Registered stages, in execution order.
    pub fn stages(&self) -> Vec<Stage> {
        self.runners.iter().map(|r| r.stage()).collect()
    }

    /// Run every registered stage once.
    ///
    /// Per-item failures end up in the report; an `Err` means the Ledger
    /// itself could not be read or written.
    pub async fn run(&self) -> Result<RunReport, Error> {
        let mut report = RunReport::new();
        let span = info_span!("run", run_id = %report.run_id);

        async {
            info!(stages = ?self.stages(), "Pipeline run started");
            for runner in &self.runners {
                runner.run(&mut report).await?;
            }
            info!(
                outcomes = report.outcomes.len(),
                conflicts = report.conflicts,
                "Pipeline run complete"
            );
            Ok::<(), Error>(())
        }
        .instrument(span)
        .await?;

        Ok(report)
    }
}
