//! Pipeline core: the work journal, stage runners and the scheduler.
//!
//! - `journal`: append-only status ledger for work items
//! - `checkpoint`: staged artifacts, drafts and decisions on disk
//! - `ingest` / `refinery`: the two model-backed stages
//! - `scheduler`: the loop that ties them together

pub mod checkpoint;
pub mod ingest;
pub mod journal;
pub mod obligations;
pub mod refinery;
pub mod safety;
pub mod scheduler;
pub mod stage;

pub use checkpoint::{CheckpointError, CheckpointStore};
pub use ingest::IngestStage;
pub use journal::{JournalError, JournalSnapshot, WorkJournal};
pub use refinery::Refinery;
pub use safety::{SafetyLimits, SafetyViolation};
pub use scheduler::{PassReport, PreflightReport, Scheduler};
pub use stage::{with_retries, RetryPolicy, StageError};
