//! Stage errors and the bounded retry loop shared by Ingest and Refinery.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use super::checkpoint::CheckpointError;
use super::journal::{JournalError, WorkJournal};
use super::safety::SafetyViolation;
use crate::adapters::extract::ExtractError;
use crate::adapters::ModelError;
use crate::domain::WorkItem;
use crate::ingest::LedgerError;
use crate::resources::ResourceError;
use crate::vault::{ArchiveError, WriterError};

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Source vanished: {0}")]
    SourceMissing(PathBuf),

    #[error("Unsupported input: {0}")]
    Unsupported(String),

    #[error("Transient IO error ({context}): {source}")]
    TransientIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Extraction(#[from] ExtractError),

    #[error(transparent)]
    Safety(#[from] SafetyViolation),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl StageError {
    /// IO failure on a source path; a missing file is permanent
    pub fn source_io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::SourceMissing(path.to_path_buf());
        }
        Self::TransientIo {
            context: path.display().to_string(),
            source,
        }
    }

    /// Whether another attempt of the same stage can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceMissing(_) | Self::Unsupported(_) | Self::Safety(_) => false,
            Self::TransientIo { .. } => true,
            Self::Resource(e) => e.is_retryable(),
            Self::Model(e) => e.is_retryable(),
            Self::Extraction(e) => e.is_transient(),
            Self::Checkpoint(CheckpointError::Io { .. }) => true,
            Self::Checkpoint(CheckpointError::Corrupt { .. }) => false,
            Self::Journal(_) => false,
            Self::Writer(WriterError::Io { .. }) => true,
            Self::Writer(WriterError::FrontMatter(_)) => false,
            Self::Archive(ArchiveError::Io { .. }) => true,
            Self::Archive(ArchiveError::SourceMissing(_)) => false,
            Self::Ledger(_) => true,
        }
    }
}

/// `retry:` block of the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per stage, the first one included
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Pause before the next attempt, or `None` when `error` after `attempt`
    /// tries ends the stage
    pub fn pause_after(&self, attempt: u32, error: &StageError) -> Option<Duration> {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.initial_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Some(Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64))
    }
}

/// Run `op` until it succeeds, fails permanently or the policy gives up.
///
/// Every retry is recorded in the journal against `item`.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    journal: &WorkJournal,
    item: &WorkItem,
    stage: &'static str,
    mut op: F,
) -> Result<T, StageError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let started = Instant::now();

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let Some(delay) = policy.pause_after(attempt, &e) else {
                    error!(
                        item = %item.short_id(),
                        stage,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %e,
                        "Stage failed permanently"
                    );
                    return Err(e);
                };
                journal.record_retry(item, attempt, &e.to_string()).await?;

                warn!(
                    item = %item.short_id(),
                    stage,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Stage failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JournalEventType, WorkKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn item() -> WorkItem {
        WorkItem::from_file(PathBuf::from("/drop/a.md"), WorkKind::Note, "abc".into())
    }

    fn immediate(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            max_delay_ms: 5_000,
            ..Default::default()
        };
        let transient = StageError::Model(ModelError::Timeout(1));
        assert_eq!(policy.pause_after(1, &transient), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.pause_after(2, &transient), Some(Duration::from_millis(2_000)));
        assert_eq!(policy.pause_after(4, &transient), Some(Duration::from_millis(5_000)));
        assert_eq!(policy.pause_after(6, &transient), None);

        let permanent = StageError::Unsupported("x".into());
        assert_eq!(policy.pause_after(1, &permanent), None);
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 5").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay_ms, 1_000);
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let temp = TempDir::new().unwrap();
        let journal = WorkJournal::new(temp.path().join("journal.jsonl"));
        let item = item();
        let calls = AtomicU32::new(0);

        let result = with_retries(&immediate(3), &journal, &item, "ingest", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StageError::Model(ModelError::Timeout(1)))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        let retries = journal
            .replay()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == JournalEventType::Retrying)
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let temp = TempDir::new().unwrap();
        let journal = WorkJournal::new(temp.path().join("journal.jsonl"));
        let calls = AtomicU32::new(0);

        let err = with_retries(&immediate(5), &journal, &item(), "ingest", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StageError::SourceMissing(PathBuf::from("/drop/a.md"))) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StageError::SourceMissing(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let temp = TempDir::new().unwrap();
        let journal = WorkJournal::new(temp.path().join("journal.jsonl"));
        let calls = AtomicU32::new(0);

        let result = with_retries(&immediate(3), &journal, &item(), "refinery", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StageError::Model(ModelError::Invocation("boom".into()))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
