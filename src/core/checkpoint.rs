//! Stage checkpoints.
//!
//! ```text
//! <home>/staged/<item>.json            StagedArtifact
//! <home>/staged/<item>/                assets pulled from the source
//! <home>/drafts/<item>.json            NoteDraft
//! <home>/drafts/<item>.decision.json   CategoryDecision
//! ```
//!
//! All writes are atomic; a checkpoint is either fully present or absent.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{CategoryDecision, NoteDraft, StagedArtifact};
use crate::fsutil::write_json_atomic;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt checkpoint {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    staged_dir: PathBuf,
    drafts_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(staged_dir: impl Into<PathBuf>, drafts_dir: impl Into<PathBuf>) -> Self {
        Self {
            staged_dir: staged_dir.into(),
            drafts_dir: drafts_dir.into(),
        }
    }

    pub fn artifact_path(&self, id: Uuid) -> PathBuf {
        self.staged_dir.join(format!("{}.json", id))
    }

    /// Directory for binary assets staged with an artifact
    pub fn assets_dir(&self, id: Uuid) -> PathBuf {
        self.staged_dir.join(id.to_string())
    }

    fn draft_path(&self, id: Uuid) -> PathBuf {
        self.drafts_dir.join(format!("{}.json", id))
    }

    fn decision_path(&self, id: Uuid) -> PathBuf {
        self.drafts_dir.join(format!("{}.decision.json", id))
    }

    pub async fn save_artifact(&self, artifact: &StagedArtifact) -> Result<(), CheckpointError> {
        save(&self.artifact_path(artifact.item_id), artifact).await
    }

    pub async fn load_artifact(&self, id: Uuid) -> Result<Option<StagedArtifact>, CheckpointError> {
        load(&self.artifact_path(id)).await
    }

    pub async fn save_draft(&self, id: Uuid, draft: &NoteDraft) -> Result<(), CheckpointError> {
        save(&self.draft_path(id), draft).await
    }

    pub async fn load_draft(&self, id: Uuid) -> Result<Option<NoteDraft>, CheckpointError> {
        load(&self.draft_path(id)).await
    }

    pub async fn save_decision(
        &self,
        id: Uuid,
        decision: &CategoryDecision,
    ) -> Result<(), CheckpointError> {
        save(&self.decision_path(id), decision).await
    }

    pub async fn load_decision(&self, id: Uuid) -> Result<Option<CategoryDecision>, CheckpointError> {
        load(&self.decision_path(id)).await
    }

    /// Carry the artifact and draft of a failed item over to its re-queued
    /// successor. Returns true if an artifact was adopted.
    pub async fn adopt(&self, from: Uuid, to: Uuid) -> Result<bool, CheckpointError> {
        let Some(mut artifact) = self.load_artifact(from).await? else {
            return Ok(false);
        };

        let old_assets = self.assets_dir(from);
        let new_assets = self.assets_dir(to);
        if tokio::fs::try_exists(&old_assets).await.unwrap_or(false) {
            copy_dir(&old_assets, &new_assets).await?;
            artifact.assets = artifact
                .assets
                .iter()
                .map(|p| match p.strip_prefix(&old_assets) {
                    Ok(rel) => new_assets.join(rel),
                    Err(_) => p.clone(),
                })
                .collect();
        }

        artifact.item_id = to;
        self.save_artifact(&artifact).await?;

        if let Some(draft) = self.load_draft(from).await? {
            self.save_draft(to, &draft).await?;
        }

        debug!(%from, %to, "Adopted checkpoints");
        Ok(true)
    }

    /// Drop every checkpoint of a committed item
    pub async fn remove(&self, id: Uuid) -> Result<(), CheckpointError> {
        for path in [
            self.artifact_path(id),
            self.draft_path(id),
            self.decision_path(id),
        ] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(CheckpointError::Io { path, source }),
            }
        }

        let assets = self.assets_dir(id);
        match tokio::fs::remove_dir_all(&assets).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io {
                path: assets,
                source,
            }),
        }
    }
}

async fn save<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    write_json_atomic(path, value)
        .await
        .map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })
}

async fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CheckpointError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

async fn copy_dir(from: &Path, to: &Path) -> Result<(), CheckpointError> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source| CheckpointError::Io { path, source }
    };

    tokio::fs::create_dir_all(to).await.map_err(io(to))?;
    let mut entries = tokio::fs::read_dir(from).await.map_err(io(from))?;
    while let Some(entry) = entries.next_entry().await.map_err(io(from))? {
        let target = to.join(entry.file_name());
        if entry.file_type().await.map_err(io(&entry.path()))?.is_file() {
            tokio::fs::copy(entry.path(), &target)
                .await
                .map_err(io(&target))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Identity, WorkKind};
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> CheckpointStore {
        CheckpointStore::new(temp.path().join("staged"), temp.path().join("drafts"))
    }

    #[tokio::test]
    async fn test_artifact_roundtrip_and_remove() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let id = Uuid::new_v4();
        let artifact = StagedArtifact::new(
            id,
            Identity::Path("/drop/memo.m4a".into()),
            WorkKind::Audio,
            "hello".into(),
        )
        .with_model("large-v3", false);

        assert!(store.load_artifact(id).await.unwrap().is_none());
        store.save_artifact(&artifact).await.unwrap();
        let loaded = store.load_artifact(id).await.unwrap().unwrap();
        assert_eq!(loaded.text, "hello");
        assert_eq!(loaded.extraction_model.as_deref(), Some("large-v3"));

        store.save_draft(id, &NoteDraft::default()).await.unwrap();
        store.remove(id).await.unwrap();
        assert!(store.load_artifact(id).await.unwrap().is_none());
        assert!(store.load_draft(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_adopt_moves_assets_references() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());

        let assets = store.assets_dir(old);
        std::fs::create_dir_all(&assets).unwrap();
        std::fs::write(assets.join("img-000.png"), b"png").unwrap();

        let artifact = StagedArtifact::new(
            old,
            Identity::Path("/drop/scan.pdf".into()),
            WorkKind::Document,
            "text".into(),
        )
        .with_assets(vec![assets.join("img-000.png")]);
        store.save_artifact(&artifact).await.unwrap();

        assert!(store.adopt(old, new).await.unwrap());
        let adopted = store.load_artifact(new).await.unwrap().unwrap();
        assert_eq!(adopted.item_id, new);
        assert_eq!(adopted.assets, vec![store.assets_dir(new).join("img-000.png")]);
        assert!(adopted.assets[0].exists());

        assert!(!store.adopt(Uuid::new_v4(), new).await.unwrap());
    }
}
