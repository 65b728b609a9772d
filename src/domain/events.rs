//! Journal events for work items.
//!
//! Every status change is recorded as an immutable event in an append-only
//! log. The current state of every work item is reconstructed by replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::work_item::{WorkItem, WorkStatus};

/// A single entry in the work journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The work item this event belongs to
    pub item_id: Uuid,

    /// Type of event
    pub event_type: JournalEventType,

    /// Status of the item after this event
    pub status: WorkStatus,

    /// Human-readable summary (NO content)
    pub summary: String,

    /// Full item snapshot (discovery events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<WorkItem>,

    /// Time taken in milliseconds (for completed stages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed or retrying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JournalEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        item_id: Uuid,
        event_type: JournalEventType,
        status: WorkStatus,
        summary: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            item_id,
            event_type,
            status,
            summary,
            item: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Discovery event carrying the item snapshot
    pub fn discovered(item: &WorkItem) -> Self {
        let mut event = Self::new(
            item.id,
            JournalEventType::Discovered,
            item.status,
            format!("Discovered {} {}", item.kind, item.identity.display_name()),
        );
        event.item = Some(item.clone());
        event
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of journal events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEventType {
    /// A new work item was admitted
    Discovered,

    /// The item moved to a new status
    StatusChanged,

    /// A stage failed and is being retried
    Retrying,

    /// The item failed permanently
    Failed,

    /// A failed item was re-queued as a new item
    Requeued,
}
