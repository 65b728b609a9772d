//! Drop-folder intake.
//!
//! 1. **Watcher**: polls the drop folder and admits files once stable
//! 2. **Classify**: decides what kind of work an admitted file is
//! 3. **Ledger**: claims and annotates entries of link-queue files
//!
//! # Architecture
//!
//! ```text
//! drop/ ──poll──► DropWatcher ──► Admission::Item ──────► WorkItem (journal)
//!                                └► Admission::QueueFile ─► QueueLedger ─► WorkItem per URL
//! ```

pub mod classify;
pub mod ledger;
pub mod watcher;

pub use classify::{classify, document_format, DocumentFormat, EntryClass};
pub use ledger::{
    ClaimedLink, LedgerError, QueueClaim, QueueDocument, QueueEntry, QueueLedger, QueueStatus,
};
pub use watcher::{Admission, DropWatcher, PollResult, WatchSettings, WatcherError};
