//! Work items: one drop-folder entry or one queued link.
//!
//! Status only ever moves forward:
//!
//! ```text
//! Pending → Ingesting → Staged → Refining → Categorizing → Writing → Done
//!    └──────────┴──────────┴─────────┴────────────┴────────────┴──→ Failed
//! ```
//!
//! A failed item is never revived. Re-queueing creates a fresh item that
//! points back at the failed one through `requeued_from`.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Where a work item's content comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    /// A file in the drop folder
    Path(PathBuf),

    /// A URL claimed from a link-queue file
    Url(String),
}

impl Identity {
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(p) => Some(p),
            Self::Url(_) => None,
        }
    }

    pub fn as_url(&self) -> Option<&str> {
        match self {
            Self::Url(u) => Some(u),
            Self::Path(_) => None,
        }
    }

    /// Short human-readable name (file name or URL)
    pub fn display_name(&self) -> String {
        match self {
            Self::Path(p) => p
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| p.display().to_string()),
            Self::Url(u) => u.clone(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Url(u) => write!(f, "{}", u),
        }
    }
}

/// Input class decided by the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Recordings (audio or video)
    Audio,

    /// PDFs and images
    Document,

    /// Plain text / markdown
    Note,

    /// A URL from a queue file
    Link,
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Note => "note",
            Self::Link => "link",
        };
        f.write_str(s)
    }
}

/// Pipeline status of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Ingesting,
    Staged,
    Refining,
    Categorizing,
    Writing,
    Done,
    Failed,
}

impl WorkStatus {
    /// Every status, in pipeline order
    pub const ALL: [WorkStatus; 8] = [
        Self::Pending,
        Self::Ingesting,
        Self::Staged,
        Self::Refining,
        Self::Categorizing,
        Self::Writing,
        Self::Done,
        Self::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// The status that follows this one on the happy path
    pub fn next(self) -> Option<WorkStatus> {
        match self {
            Self::Pending => Some(Self::Ingesting),
            Self::Ingesting => Some(Self::Staged),
            Self::Staged => Some(Self::Refining),
            Self::Refining => Some(Self::Categorizing),
            Self::Categorizing => Some(Self::Writing),
            Self::Writing => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    /// Whether `to` is a legal successor. Re-entering the same status is
    /// allowed and treated as a no-op by callers.
    pub fn can_transition_to(self, to: WorkStatus) -> bool {
        if self == to {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        to == Self::Failed || self.next() == Some(to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ingesting => "ingesting",
            Self::Staged => "staged",
            Self::Refining => "refining",
            Self::Categorizing => "categorizing",
            Self::Writing => "writing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl Default for WorkStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status change
#[derive(Debug, Clone, Error)]
#[error("Invalid status transition for {item}: {from} → {to}")]
pub struct TransitionError {
    pub item: Uuid,
    pub from: WorkStatus,
    pub to: WorkStatus,
}

/// A unit of pipeline work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,

    pub identity: Identity,

    pub kind: WorkKind,

    pub discovered_at: DateTime<Utc>,

    #[serde(default)]
    pub status: WorkStatus,

    /// SHA256 prefix of the file contents (files only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    /// Queue file the link was claimed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<PathBuf>,

    /// Line of the queue entry within `origin` (0-based)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_line: Option<usize>,

    /// Failed item this one was re-queued from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeued_from: Option<Uuid>,

    /// Reason for the terminal failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkItem {
    pub fn new(identity: Identity, kind: WorkKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            kind,
            discovered_at: Utc::now(),
            status: WorkStatus::Pending,
            content_hash: None,
            origin: None,
            origin_line: None,
            requeued_from: None,
            error: None,
        }
    }

    /// A file admitted from the drop folder
    pub fn from_file(path: PathBuf, kind: WorkKind, content_hash: String) -> Self {
        let mut item = Self::new(Identity::Path(path), kind);
        item.content_hash = Some(content_hash);
        item
    }

    /// A link claimed from line `line` of a queue file
    pub fn from_link(url: impl Into<String>, queue_file: PathBuf, line: usize) -> Self {
        let mut item = Self::new(Identity::Url(url.into()), WorkKind::Link);
        item.origin = Some(queue_file);
        item.origin_line = Some(line);
        item
    }

    /// Whether this item was claimed from `line` of `queue_file` for `url`
    pub fn claimed_from(&self, queue_file: &Path, line: usize, url: &str) -> bool {
        self.identity.as_url() == Some(url)
            && self.origin.as_deref() == Some(queue_file)
            && self.origin_line == Some(line)
    }

    /// First 8 characters of the id
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }

    /// Move to `to`. Returns `Ok(false)` when already there.
    pub fn transition(&mut self, to: WorkStatus) -> Result<bool, TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                item: self.id,
                from: self.status,
                to,
            });
        }
        if self.status == to {
            return Ok(false);
        }
        self.status = to;
        Ok(true)
    }

    /// Fresh pending copy of a failed item. History of `self` is untouched.
    pub fn requeue(&self) -> WorkItem {
        WorkItem {
            id: Uuid::new_v4(),
            identity: self.identity.clone(),
            kind: self.kind,
            discovered_at: Utc::now(),
            status: WorkStatus::Pending,
            content_hash: self.content_hash.clone(),
            origin: self.origin.clone(),
            origin_line: self.origin_line,
            requeued_from: Some(self.id),
            error: None,
        }
    }
}
