//! Append-only work journal.
//!
//! Every work item and every status change is a line of JSON in
//! `<home>/journal.jsonl`. Current state is rebuilt by replaying the log, so
//! a crash at any point loses at most the line being written. Appends take an
//! exclusive advisory lock so a front-end process can share the file.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{JournalEvent, JournalEventType, TransitionError, WorkItem, WorkStatus};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Journal IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize journal event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("No work item matches '{0}'")]
    NotFound(String),

    #[error("'{prefix}' matches {count} work items, use a longer prefix")]
    Ambiguous { prefix: String, count: usize },

    #[error("Work item {id} is {status}, only failed items can be re-queued")]
    NotFailed { id: Uuid, status: WorkStatus },
}

/// Replayed item state at one point in time
#[derive(Debug, Clone, Default)]
pub struct JournalSnapshot {
    items: Vec<WorkItem>,
}

impl JournalSnapshot {
    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    /// Whether a file with this path and content is already known
    pub fn knows_file(&self, path: &Path, content_hash: &str) -> bool {
        self.items.iter().any(|i| {
            i.identity.as_path() == Some(path) && i.content_hash.as_deref() == Some(content_hash)
        })
    }

    /// Latest item claimed from `line` of `queue_file` for `url`
    pub fn claimed(&self, queue_file: &Path, line: usize, url: &str) -> Option<&WorkItem> {
        self.items
            .iter()
            .rev()
            .find(|i| i.claimed_from(queue_file, line, url))
    }

    /// Track an item recorded after the snapshot was taken
    pub fn insert(&mut self, item: WorkItem) {
        self.items.push(item);
    }
}

/// JSONL work journal
#[derive(Debug, Clone)]
pub struct WorkJournal {
    path: PathBuf,
}

impl WorkJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> JournalError {
        JournalError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Append one event under an exclusive lock.
    ///
    /// A torn last line from an interrupted write is terminated first so the
    /// new event starts on a line of its own.
    pub async fn append(&self, event: &JournalEvent) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?;
            file.lock_exclusive()?;
            let written = terminate_torn_line(&mut file)
                .and_then(|_| file.write_all(line.as_bytes()))
                .and_then(|_| file.sync_data());
            let unlocked = FileExt::unlock(&file);
            written.and(unlocked)
        })
        .await
        .map_err(|e| self.io_error(std::io::Error::new(std::io::ErrorKind::Other, e)))?
        .map_err(|e| self.io_error(e))
    }

    /// Replay all events in order; unreadable lines are skipped
    pub async fn replay(&self) -> Result<Vec<JournalEvent>, JournalError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut events = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = number + 1,
                    error = %e,
                    "Skipping unreadable journal line"
                ),
            }
        }
        Ok(events)
    }

    /// Current state of every item, in discovery order
    pub async fn items(&self) -> Result<Vec<WorkItem>, JournalError> {
        let events = self.replay().await?;
        let mut order: Vec<Uuid> = Vec::new();
        let mut items: HashMap<Uuid, WorkItem> = HashMap::new();

        for event in &events {
            if let Some(item) = apply_event(&mut items, event) {
                order.push(item);
            }
        }

        Ok(order.into_iter().filter_map(|id| items.remove(&id)).collect())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<WorkItem>, JournalError> {
        Ok(self.items().await?.into_iter().find(|i| i.id == id))
    }

    /// Items that have not reached Done or Failed
    pub async fn unfinished(&self) -> Result<Vec<WorkItem>, JournalError> {
        Ok(self
            .items()
            .await?
            .into_iter()
            .filter(|i| !i.status.is_terminal())
            .collect())
    }

    /// Replay once for a batch of lookups
    pub async fn snapshot(&self) -> Result<JournalSnapshot, JournalError> {
        Ok(JournalSnapshot {
            items: self.items().await?,
        })
    }

    pub async fn record_discovered(&self, item: &WorkItem) -> Result<(), JournalError> {
        debug!(item = %item.short_id(), kind = %item.kind, "Recording new work item");
        self.append(&JournalEvent::discovered(item)).await
    }

    /// Move `item` to `to` and record it; a no-op transition writes nothing
    pub async fn record_transition(
        &self,
        item: &mut WorkItem,
        to: WorkStatus,
        duration_ms: Option<u64>,
    ) -> Result<bool, JournalError> {
        let from = item.status;
        if !item.transition(to)? {
            return Ok(false);
        }

        let mut event = JournalEvent::new(
            item.id,
            JournalEventType::StatusChanged,
            to,
            format!("{} → {}", from, to),
        );
        if let Some(ms) = duration_ms {
            event = event.with_duration(ms);
        }
        self.append(&event).await?;
        Ok(true)
    }

    /// Terminal failure with a human-readable reason
    pub async fn record_failure(&self, item: &mut WorkItem, reason: &str) -> Result<(), JournalError> {
        let from = item.status;
        item.transition(WorkStatus::Failed)?;
        item.error = Some(reason.to_string());

        let event = JournalEvent::new(
            item.id,
            JournalEventType::Failed,
            WorkStatus::Failed,
            format!("Failed during {}", from),
        )
        .with_error(reason.to_string());
        self.append(&event).await
    }

    pub async fn record_retry(
        &self,
        item: &WorkItem,
        attempt: u32,
        error: &str,
    ) -> Result<(), JournalError> {
        let event = JournalEvent::new(
            item.id,
            JournalEventType::Retrying,
            item.status,
            format!("Retrying {} (attempt {})", item.status, attempt),
        )
        .with_error(error.to_string());
        self.append(&event).await
    }

    /// Unique item whose id starts with `prefix`
    pub async fn find_by_prefix(&self, prefix: &str) -> Result<WorkItem, JournalError> {
        let prefix = prefix.trim().to_lowercase();
        let mut matches: Vec<WorkItem> = self
            .items()
            .await?
            .into_iter()
            .filter(|i| i.id.to_string().starts_with(&prefix))
            .collect();

        match matches.len() {
            0 => Err(JournalError::NotFound(prefix)),
            1 => Ok(matches.remove(0)),
            count => Err(JournalError::Ambiguous { prefix, count }),
        }
    }

    /// Re-queue a failed item as a new pending item
    pub async fn requeue(&self, prefix: &str) -> Result<WorkItem, JournalError> {
        let failed = self.find_by_prefix(prefix).await?;
        if failed.status != WorkStatus::Failed {
            return Err(JournalError::NotFailed {
                id: failed.id,
                status: failed.status,
            });
        }

        let fresh = failed.requeue();
        self.append(&JournalEvent::new(
            failed.id,
            JournalEventType::Requeued,
            WorkStatus::Failed,
            format!("Re-queued as {}", fresh.short_id()),
        ))
        .await?;
        self.record_discovered(&fresh).await?;
        Ok(fresh)
    }

    /// Number of items per status, in pipeline order
    pub async fn status_counts(&self) -> Result<Vec<(WorkStatus, usize)>, JournalError> {
        let items = self.items().await?;
        Ok(WorkStatus::ALL
            .iter()
            .map(|s| (*s, items.iter().filter(|i| i.status == *s).count()))
            .collect())
    }
}

/// Write a newline if the file is non-empty and does not end with one
fn terminate_torn_line(file: &mut std::fs::File) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        warn!("Terminating torn journal line");
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Apply one event to the item map. Returns the id when the event
/// introduces a new item.
fn apply_event(items: &mut HashMap<Uuid, WorkItem>, event: &JournalEvent) -> Option<Uuid> {
    match event.event_type {
        JournalEventType::Discovered => {
            let mut item = event.item.clone()?;
            item.status = event.status;
            let is_new = !items.contains_key(&item.id);
            let id = item.id;
            items.insert(id, item);
            is_new.then_some(id)
        }
        JournalEventType::StatusChanged | JournalEventType::Failed => {
            if let Some(item) = items.get_mut(&event.item_id) {
                item.status = event.status;
                if event.event_type == JournalEventType::Failed {
                    item.error = event.error.clone();
                }
            }
            None
        }
        JournalEventType::Retrying | JournalEventType::Requeued => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WorkKind;
    use tempfile::TempDir;

    fn journal(temp: &TempDir) -> WorkJournal {
        WorkJournal::new(temp.path().join("journal.jsonl"))
    }

    fn audio(name: &str) -> WorkItem {
        WorkItem::from_file(PathBuf::from(format!("/drop/{}", name)), WorkKind::Audio, "abc".into())
    }

    #[tokio::test]
    async fn test_replay_rebuilds_state() {
        let temp = TempDir::new().unwrap();
        let journal = journal(&temp);

        let mut first = audio("a.m4a");
        let mut second = audio("b.m4a");
        journal.record_discovered(&first).await.unwrap();
        journal.record_discovered(&second).await.unwrap();

        journal
            .record_transition(&mut first, WorkStatus::Ingesting, None)
            .await
            .unwrap();
        journal
            .record_transition(&mut first, WorkStatus::Staged, Some(1200))
            .await
            .unwrap();
        journal.record_failure(&mut second, "whisper crashed").await.unwrap();

        let items = journal.items().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, first.id);
        assert_eq!(items[0].status, WorkStatus::Staged);
        assert_eq!(items[1].status, WorkStatus::Failed);
        assert_eq!(items[1].error.as_deref(), Some("whisper crashed"));

        let unfinished = journal.unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 1);
    }

    #[tokio::test]
    async fn test_noop_transition_is_not_recorded() {
        let temp = TempDir::new().unwrap();
        let journal = journal(&temp);
        let mut item = audio("a.m4a");
        journal.record_discovered(&item).await.unwrap();

        assert!(journal
            .record_transition(&mut item, WorkStatus::Ingesting, None)
            .await
            .unwrap());
        assert!(!journal
            .record_transition(&mut item, WorkStatus::Ingesting, None)
            .await
            .unwrap());
        assert_eq!(journal.replay().await.unwrap().len(), 2);

        let err = journal
            .record_transition(&mut item, WorkStatus::Pending, None)
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::Transition(_)));
    }

    #[tokio::test]
    async fn test_corrupt_tail_is_skipped() {
        let temp = TempDir::new().unwrap();
        let journal = journal(&temp);
        let item = audio("a.m4a");
        journal.record_discovered(&item).await.unwrap();

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(journal.path())
            .unwrap();
        file.write_all(b"{\"id\": \"trunc").unwrap();

        let items = journal.items().await.unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_append_after_torn_line_is_kept() {
        let temp = TempDir::new().unwrap();
        let journal = journal(&temp);
        std::fs::write(journal.path(), b"{\"type\":\"discov").unwrap();

        let item = audio("a.m4a");
        journal.record_discovered(&item).await.unwrap();

        let items = journal.items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, item.id);

        let content = std::fs::read_to_string(journal.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_requeue_creates_new_item() {
        let temp = TempDir::new().unwrap();
        let journal = journal(&temp);
        let mut item = audio("a.m4a");
        journal.record_discovered(&item).await.unwrap();

        let prefix = item.short_id();
        assert!(matches!(
            journal.requeue(&prefix).await,
            Err(JournalError::NotFailed { .. })
        ));

        journal.record_failure(&mut item, "boom").await.unwrap();
        let fresh = journal.requeue(&prefix).await.unwrap();
        assert_eq!(fresh.requeued_from, Some(item.id));
        assert_eq!(fresh.status, WorkStatus::Pending);

        let items = journal.items().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].status, WorkStatus::Failed);
        assert_eq!(items[1].id, fresh.id);

        assert!(matches!(
            journal.find_by_prefix("zzzz").await,
            Err(JournalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dedupe_lookups() {
        let temp = TempDir::new().unwrap();
        let journal = journal(&temp);
        let item = audio("a.m4a");
        journal.record_discovered(&item).await.unwrap();

        let link = WorkItem::from_link("https://example.com", PathBuf::from("/drop/queue.md"), 2);
        journal.record_discovered(&link).await.unwrap();

        let mut snapshot = journal.snapshot().await.unwrap();
        assert!(snapshot.knows_file(Path::new("/drop/a.m4a"), "abc"));
        assert!(!snapshot.knows_file(Path::new("/drop/a.m4a"), "def"));

        let queue = Path::new("/drop/queue.md");
        assert_eq!(
            snapshot.claimed(queue, 2, "https://example.com").map(|i| i.id),
            Some(link.id)
        );
        assert!(snapshot.claimed(queue, 3, "https://example.com").is_none());

        let again = WorkItem::from_link("https://example.com", PathBuf::from("/drop/queue.md"), 2);
        snapshot.insert(again.clone());
        assert_eq!(
            snapshot.claimed(queue, 2, "https://example.com").map(|i| i.id),
            Some(again.id)
        );

        let counts = journal.status_counts().await.unwrap();
        assert_eq!(counts[0], (WorkStatus::Pending, 2));
    }
}
