//! Domain types for the mulch pipeline.
//!
//! - WorkItem: one unit of pipeline work and its forward-only status
//! - StagedArtifact: raw text extracted by Ingest
//! - NoteDraft: structured note produced by Refinery
//! - CategoryDecision: destination folder, tags and links
//! - JournalEvent: immutable record of a status change

pub mod artifact;
pub mod decision;
pub mod events;
pub mod note;
pub mod work_item;

pub use artifact::StagedArtifact;
pub use decision::{CategoryDecision, DecisionSource};
pub use events::{JournalEvent, JournalEventType};
pub use note::{ActionItem, NoteDraft, NoteSection, Priority};
pub use work_item::{Identity, TransitionError, WorkItem, WorkKind, WorkStatus};
