//! mulch - unattended drop-folder to knowledge-vault pipeline
//!
//! Files dropped into a watched folder (voice memos, PDFs, scans, plain
//! notes) and links listed in queue files become structured markdown notes
//! in a vault. Heavy models share a single device slot, taken through an
//! explicit lease.
//!
//! # Architecture
//!
//! ```text
//! DropWatcher ─► WorkJournal ─► Ingest ─► Refinery ─► Gardener ─► NoteWriter
//!                    ▲            │          │           │            │
//!                    └── status ──┴── ResourceManager (one heavy lease) ┘
//! ```
//!
//! Every status change is appended to a JSONL journal and each stage
//! checkpoints its output, so a restart resumes unfinished items without
//! repeating finished stages.
//!
//! # Modules
//!
//! - `adapters`: model runtimes (Ollama, whisper, tesseract, mock) and light extractors
//! - `resources`: the heavy-model lease
//! - `ingest`: drop-folder watcher, classification and link-queue ledger
//! - `core`: journal, checkpoints, stage runners and the scheduler
//! - `garden`: categorization and wikilinks
//! - `vault`: note writer, archive, daily log and vector index
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! mulch run            # watch until Ctrl+C
//! mulch once           # one pass and exit
//! mulch status
//! mulch retry 5f0c1a
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod fsutil;
pub mod garden;
pub mod ingest;
pub mod resources;
pub mod vault;

pub use core::{Scheduler, WorkJournal};
pub use domain::{CategoryDecision, NoteDraft, StagedArtifact, WorkItem, WorkKind, WorkStatus};
pub use resources::{AcquireMode, ModelLease, ResourceManager};
