//! Archive Manager: moves processed sources out of the drop folder.
//!
//! The relative layout of the drop folder is mirrored under the archive.
//! Nothing is ever deleted unless a byte-identical copy exists in the archive.

use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fsutil::compute_file_hash;

/// Suffix of in-flight cross-device copies
const PARTIAL_SUFFIX: &str = ".mulch-partial";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Source vanished before archiving: {0}")]
    SourceMissing(PathBuf),

    #[error("Archive IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Startup recovery summary
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoverReport {
    pub partials_removed: usize,
    pub sources_removed: usize,
}

#[derive(Debug, Clone)]
pub struct ArchiveManager {
    drop_root: PathBuf,
    archive_root: PathBuf,
}

impl ArchiveManager {
    pub fn new(drop_root: impl Into<PathBuf>, archive_root: impl Into<PathBuf>) -> Self {
        Self {
            drop_root: drop_root.into(),
            archive_root: archive_root.into(),
        }
    }

    /// Where `source` lands in the archive before collision handling
    pub fn mirrored_path(&self, source: &Path) -> PathBuf {
        match source.strip_prefix(&self.drop_root) {
            Ok(rel) => self.archive_root.join(rel),
            Err(_) => self
                .archive_root
                .join(source.file_name().unwrap_or(source.as_os_str())),
        }
    }

    /// Move `source` into the archive; returns the archived path.
    ///
    /// If a byte-identical copy already sits in the archive (an earlier
    /// attempt copied it but never removed the source) only the source is
    /// removed.
    pub async fn archive(&self, source: &Path) -> Result<PathBuf, ArchiveError> {
        match tokio::fs::metadata(source).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArchiveError::SourceMissing(source.to_path_buf()))
            }
            Err(e) => return Err(io_err(source)(e)),
        }

        let mirrored = self.mirrored_path(source);
        if tokio::fs::try_exists(&mirrored)
            .await
            .map_err(io_err(&mirrored))?
        {
            let hash = compute_file_hash(source).await.map_err(io_err(source))?;
            if let Some(existing) = self.archived_copy(source, &hash).await {
                tokio::fs::remove_file(source)
                    .await
                    .map_err(io_err(source))?;
                info!(source = %source.display(), archived = %existing.display(), "Source already archived, removed from drop folder");
                return Ok(existing);
            }
        }

        let target = free_path(&mirrored).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_err(parent))?;
        }

        match tokio::fs::rename(source, &target).await {
            Ok(()) => debug!(from = %source.display(), to = %target.display(), "Archived by rename"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArchiveError::SourceMissing(source.to_path_buf()))
            }
            Err(e) => {
                debug!(error = %e, "Rename failed, copying across filesystems");
                copy_then_rename(source, &target).await?;
            }
        }

        info!(source = %source.display(), archived = %target.display(), "Archived source");
        Ok(target)
    }

    /// Remove stale partial copies, and drop-folder sources of completed items
    /// whose byte-identical copy already sits in the archive.
    ///
    /// `completed` lists the source path and content hash of every Done item.
    pub async fn recover(
        &self,
        completed: &[(PathBuf, String)],
    ) -> Result<RecoverReport, ArchiveError> {
        let mut report = RecoverReport::default();

        if tokio::fs::try_exists(&self.archive_root).await.unwrap_or(false) {
            let mut stack = vec![self.archive_root.clone()];
            while let Some(dir) = stack.pop() {
                let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_err(&dir))?;
                while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
                    let path = entry.path();
                    let file_type = entry.file_type().await.map_err(io_err(&path))?;
                    if file_type.is_dir() {
                        stack.push(path);
                    } else if path.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                        tokio::fs::remove_file(&path).await.map_err(io_err(&path))?;
                        warn!(path = %path.display(), "Removed stale partial archive copy");
                        report.partials_removed += 1;
                    }
                }
            }
        }

        for (source, hash) in completed {
            if !tokio::fs::try_exists(source).await.unwrap_or(false) {
                continue;
            }
            match compute_file_hash(source).await {
                Ok(current) if current == *hash => {}
                _ => continue,
            }
            if self.archived_copy(source, hash).await.is_some() {
                tokio::fs::remove_file(source)
                    .await
                    .map_err(io_err(source))?;
                warn!(path = %source.display(), "Removed source already present in archive");
                report.sources_removed += 1;
            }
        }

        Ok(report)
    }

    /// An archived file derived from `source`'s name with content `hash`
    async fn archived_copy(&self, source: &Path, hash: &str) -> Option<PathBuf> {
        let mirrored = self.mirrored_path(source);
        let dir = mirrored.parent()?;
        let stem = mirrored.file_stem()?.to_string_lossy().to_string();

        let mut entries = tokio::fs::read_dir(dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&stem) || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            if compute_file_hash(&path).await.ok().as_deref() == Some(hash) {
                return Some(path);
            }
        }
        None
    }
}

/// `path` itself if free, else `stem-YYYYMMDD-HHMMSS[-n].ext`
async fn free_path(path: &Path) -> Result<PathBuf, ArchiveError> {
    if !taken(path).await? {
        return Ok(path.to_path_buf());
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut candidate = dir.join(format!("{}-{}{}", stem, stamp, ext));
    let mut counter = 1;
    while taken(&candidate).await? {
        candidate = dir.join(format!("{}-{}-{}{}", stem, stamp, counter, ext));
        counter += 1;
    }
    Ok(candidate)
}

async fn taken(path: &Path) -> Result<bool, ArchiveError> {
    tokio::fs::try_exists(path).await.map_err(io_err(path))
}

/// Copy to a hidden partial file, fsync, rename into place, then remove the source
pub(crate) async fn copy_then_rename(source: &Path, target: &Path) -> Result<(), ArchiveError> {
    let dir = target.parent().unwrap_or(Path::new("."));
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let partial = dir.join(format!(".{}{}", name, PARTIAL_SUFFIX));

    tokio::fs::copy(source, &partial).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ArchiveError::SourceMissing(source.to_path_buf())
        } else {
            io_err(&partial)(e)
        }
    })?;

    let file = tokio::fs::File::open(&partial)
        .await
        .map_err(io_err(&partial))?;
    file.sync_all().await.map_err(io_err(&partial))?;
    drop(file);

    tokio::fs::rename(&partial, target)
        .await
        .map_err(io_err(target))?;
    tokio::fs::remove_file(source)
        .await
        .map_err(io_err(source))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ArchiveManager) {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("drop/voice")).unwrap();
        let manager = ArchiveManager::new(temp.path().join("drop"), temp.path().join("archive"));
        (temp, manager)
    }

    #[tokio::test]
    async fn test_archive_mirrors_relative_path() {
        let (temp, manager) = setup();
        let source = temp.path().join("drop/voice/memo.m4a");
        std::fs::write(&source, b"audio").unwrap();

        let archived = manager.archive(&source).await.unwrap();
        assert_eq!(archived, temp.path().join("archive/voice/memo.m4a"));
        assert!(!source.exists());
        assert_eq!(std::fs::read(&archived).unwrap(), b"audio");
    }

    #[tokio::test]
    async fn test_collision_gets_timestamp_suffix() {
        let (temp, manager) = setup();
        std::fs::create_dir_all(temp.path().join("archive/voice")).unwrap();
        std::fs::write(temp.path().join("archive/voice/memo.m4a"), b"old").unwrap();

        let source = temp.path().join("drop/voice/memo.m4a");
        std::fs::write(&source, b"new").unwrap();
        let archived = manager.archive(&source).await.unwrap();

        let name = archived.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("memo-"));
        assert!(name.ends_with(".m4a"));
        assert_eq!(
            std::fs::read(temp.path().join("archive/voice/memo.m4a")).unwrap(),
            b"old"
        );
        assert_eq!(std::fs::read(&archived).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_rearchive_after_interrupted_copy_keeps_one_copy() {
        let (temp, manager) = setup();
        let source = temp.path().join("drop/voice/memo.m4a");
        std::fs::write(&source, b"audio").unwrap();

        // The copy was renamed into place, the source removal never happened
        std::fs::create_dir_all(temp.path().join("archive/voice")).unwrap();
        std::fs::copy(&source, temp.path().join("archive/voice/memo.m4a")).unwrap();

        let archived = manager.archive(&source).await.unwrap();
        assert_eq!(archived, temp.path().join("archive/voice/memo.m4a"));
        assert!(!source.exists());
        let copies = std::fs::read_dir(temp.path().join("archive/voice")).unwrap().count();
        assert_eq!(copies, 1);
    }

    #[tokio::test]
    async fn test_unreadable_archive_dir_is_an_error() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let err = free_path(&blocker.join("memo.m4a")).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Io { .. }));
    }

    #[tokio::test]
    async fn test_missing_source() {
        let (temp, manager) = setup();
        let err = manager
            .archive(&temp.path().join("drop/nope.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn test_copy_path_leaves_no_partial() {
        let (temp, _) = setup();
        let source = temp.path().join("drop/voice/memo.m4a");
        std::fs::write(&source, b"audio").unwrap();
        std::fs::create_dir_all(temp.path().join("archive")).unwrap();
        let target = temp.path().join("archive/memo.m4a");

        copy_then_rename(&source, &target).await.unwrap();
        assert!(!source.exists());
        assert!(target.exists());
        assert!(!temp.path().join("archive/.memo.m4a.mulch-partial").exists());
    }

    #[tokio::test]
    async fn test_recover_after_crash_mid_archive() {
        let (temp, manager) = setup();
        let source = temp.path().join("drop/voice/memo.m4a");
        std::fs::write(&source, b"audio").unwrap();
        let hash = compute_file_hash(&source).await.unwrap();

        // Crash after the copy landed but before the source was removed,
        // with a second partial left over from an earlier attempt.
        std::fs::create_dir_all(temp.path().join("archive/voice")).unwrap();
        std::fs::copy(&source, temp.path().join("archive/voice/memo.m4a")).unwrap();
        std::fs::write(
            temp.path().join("archive/voice/.memo.m4a.mulch-partial"),
            b"aud",
        )
        .unwrap();

        let report = manager.recover(&[(source.clone(), hash)]).await.unwrap();
        assert_eq!(report.partials_removed, 1);
        assert_eq!(report.sources_removed, 1);
        assert!(!source.exists());
        assert!(temp.path().join("archive/voice/memo.m4a").exists());
    }

    #[tokio::test]
    async fn test_recover_keeps_sources_without_identical_copy() {
        let (temp, manager) = setup();
        let source = temp.path().join("drop/voice/memo.m4a");
        std::fs::write(&source, b"audio").unwrap();
        let hash = compute_file_hash(&source).await.unwrap();

        std::fs::create_dir_all(temp.path().join("archive/voice")).unwrap();
        std::fs::write(temp.path().join("archive/voice/memo.m4a"), b"different").unwrap();

        let report = manager.recover(&[(source.clone(), hash)]).await.unwrap();
        assert_eq!(report.sources_removed, 0);
        assert!(source.exists());
    }
}
