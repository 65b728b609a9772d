//! Drop-folder watcher.
//!
//! Polls the drop folder and admits a file only once its size and
//! modification time have been identical for `stable_polls` consecutive
//! polls, so half-synced or half-copied files are never picked up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::SafetyLimits;
use crate::domain::WorkKind;
use crate::fsutil::is_hidden;

use super::classify::{classify, EntryClass};

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Drop folder does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Invalid glob pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Watcher configuration (`watch:` in config.yaml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSettings {
    /// Seconds between scheduling passes
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Consecutive identical observations required before admission
    #[serde(default = "default_stable_polls")]
    pub stable_polls: u32,

    /// File name globs that are never admitted (temp/partial downloads)
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,

    /// File name globs of link-queue files
    #[serde(default = "default_queue_files")]
    pub queue_files: Vec<String>,
}

fn default_poll_interval() -> u64 {
    30
}
fn default_stable_polls() -> u32 {
    2
}
fn default_ignore() -> Vec<String> {
    [
        "*.tmp",
        "*.part",
        "*.partial",
        "*.crdownload",
        "*.download",
        "*.icloud",
        "~$*",
        "*~",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_queue_files() -> Vec<String> {
    vec![
        "queue.md".to_string(),
        "*.queue.md".to_string(),
        "links.md".to_string(),
    ]
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            stable_polls: default_stable_polls(),
            ignore: default_ignore(),
            queue_files: default_queue_files(),
        }
    }
}

impl WatchSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn queue_patterns(&self) -> Result<Vec<Pattern>, WatcherError> {
        compile(&self.queue_files)
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, WatcherError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| WatcherError::Pattern {
                pattern: p.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

/// A file that passed the stability check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Item {
        path: PathBuf,
        kind: WorkKind,
        size: u64,
    },
    QueueFile(PathBuf),
}

impl Admission {
    pub fn path(&self) -> &Path {
        match self {
            Self::Item { path, .. } | Self::QueueFile(path) => path,
        }
    }
}

/// Result of one poll
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    pub admissions: Vec<Admission>,
    /// Seen but not yet stable
    pub pending: usize,
    /// Hidden, temp or empty files
    pub ignored: usize,
    /// Denylisted, oversized or unsupported files
    pub rejected: usize,
    /// Already admitted and unchanged
    pub known: usize,
}

impl PollResult {
    pub fn total_scanned(&self) -> usize {
        self.admissions.len() + self.pending + self.ignored + self.rejected + self.known
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    size: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    fingerprint: Fingerprint,
    count: u32,
}

/// Polling drop-folder watcher with per-file stability tracking
pub struct DropWatcher {
    root: PathBuf,
    stable_polls: u32,
    limits: SafetyLimits,
    ignore: Vec<Pattern>,
    queue_files: Vec<Pattern>,
    observations: HashMap<PathBuf, Observation>,
    admitted: HashMap<PathBuf, Fingerprint>,
}

impl DropWatcher {
    pub fn new(
        root: impl Into<PathBuf>,
        settings: &WatchSettings,
        limits: SafetyLimits,
    ) -> Result<Self, WatcherError> {
        Ok(Self {
            root: root.into(),
            stable_polls: settings.stable_polls.max(1),
            limits,
            ignore: compile(&settings.ignore)?,
            queue_files: settings.queue_patterns()?,
            observations: HashMap::new(),
            admitted: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Forget an admission so the file is considered again once it is stable
    pub fn forget(&mut self, path: &Path) {
        self.admitted.remove(path);
        self.observations.remove(path);
    }

    /// Scan the drop folder once
    pub async fn poll(&mut self) -> Result<PollResult, WatcherError> {
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            return Err(WatcherError::DirectoryNotFound(self.root.clone()));
        }

        let files = self.scan().await?;
        let mut result = PollResult::default();

        for (path, fingerprint) in &files {
            let relative = path.strip_prefix(&self.root).unwrap_or(path);

            if is_hidden(relative) || self.is_ignored(path) || fingerprint.size == 0 {
                result.ignored += 1;
                continue;
            }

            if self.admitted.get(path) == Some(fingerprint) {
                result.known += 1;
                continue;
            }

            let observation = self
                .observations
                .entry(path.clone())
                .and_modify(|o| {
                    if o.fingerprint == *fingerprint {
                        o.count += 1;
                    } else {
                        *o = Observation {
                            fingerprint: *fingerprint,
                            count: 1,
                        };
                    }
                })
                .or_insert(Observation {
                    fingerprint: *fingerprint,
                    count: 1,
                });

            if observation.count < self.stable_polls {
                result.pending += 1;
                continue;
            }

            self.observations.remove(path);
            self.admitted.insert(path.clone(), *fingerprint);

            if let Err(violation) = self.limits.validate_file(path, fingerprint.size) {
                warn!(path = %path.display(), reason = %violation, "Rejected drop-folder file");
                result.rejected += 1;
                continue;
            }

            match classify(path, &self.queue_files) {
                EntryClass::Work(kind) => {
                    debug!(path = %path.display(), %kind, "File stable, admitting");
                    result.admissions.push(Admission::Item {
                        path: path.clone(),
                        kind,
                        size: fingerprint.size,
                    });
                }
                EntryClass::LinkQueue => {
                    debug!(path = %path.display(), "Queue file stable");
                    result.admissions.push(Admission::QueueFile(path.clone()));
                }
                EntryClass::Unsupported => {
                    warn!(path = %path.display(), "Unsupported file type, leaving in place");
                    result.rejected += 1;
                }
            }
        }

        // Files that disappeared (archived, deleted) start over if they come back
        self.observations.retain(|p, _| files.contains_key(p));
        self.admitted.retain(|p, _| files.contains_key(p));

        if !result.admissions.is_empty() {
            info!(
                admitted = result.admissions.len(),
                pending = result.pending,
                "Drop folder poll"
            );
        }

        Ok(result)
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return true;
        };
        self.ignore.iter().any(|p| p.matches(name))
    }

    /// Recursive listing of regular files with their fingerprints
    async fn scan(&self) -> Result<HashMap<PathBuf, Fingerprint>, WatcherError> {
        let mut files = HashMap::new();
        let mut dirs = vec![self.root.clone()];

        while let Some(dir) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // A subdirectory removed mid-scan
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir != self.root => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let metadata = match tokio::fs::metadata(&path).await {
                    Ok(m) => m,
                    Err(_) => continue,
                };

                if metadata.is_dir() {
                    let hidden = entry.file_name().to_string_lossy().starts_with('.');
                    if !hidden {
                        dirs.push(path);
                    }
                } else if metadata.is_file() {
                    files.insert(
                        path,
                        Fingerprint {
                            size: metadata.len(),
                            modified: metadata.modified().ok(),
                        },
                    );
                }
            }
        }

        Ok(files)
    }
}
