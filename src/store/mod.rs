//! Persistence layer: the libSQL-backed processing Ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlLedger;
pub use traits::{
    Artifacts, ItemKey, Ledger, LedgerRow, LedgerSummary, NewRow, Stage, Status, UpsertOutcome,
};
