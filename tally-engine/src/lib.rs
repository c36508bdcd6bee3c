//! tally-engine library interface
//!
//! Reconciliation and incremental aggregation of contributor work tracked in
//! an external tabular store:
//!
//! SOURCE READ → IDENTITY → STAGE EXTRACT → LEDGER WRITE → AGGREGATE
//!
//! Every pass is designed to be re-run on a timer. The store is the system
//! of record; the engine keeps no state between passes.

pub mod aggregator;
pub mod error;
pub mod extractor;
pub mod identity;
pub mod ledger;
pub mod locks;
pub mod models;
pub mod pass;
pub mod project_config;
pub mod retry;
pub mod schema;
pub mod source_reader;
pub mod store;
pub mod summary;

pub use crate::error::{EngineError, EngineResult};
pub use crate::models::Stage;
pub use crate::pass::{Engine, PassOptions};
pub use crate::summary::RunSummary;
