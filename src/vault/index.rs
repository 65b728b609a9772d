//! Vector index seam and a flat JSONL implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::fsutil::write_atomic;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt index record: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
}

/// One nearest-neighbour result
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: String,
    pub score: f32,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector stored under `id`
    async fn upsert(
        &self,
        id: &str,
        embedding: Vec<f32>,
        metadata: serde_json::Value,
    ) -> Result<(), IndexError>;

    /// `k` most similar vectors, best first
    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    id: String,
    embedding: Vec<f32>,
    #[serde(default)]
    metadata: serde_json::Value,
}

/// Whole-file JSONL index, rewritten atomically on every upsert
pub struct FileIndex {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<Record>, IndexError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(IndexError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(IndexError::from))
            .collect()
    }
}

#[async_trait]
impl VectorIndex for FileIndex {
    async fn upsert(
        &self,
        id: &str,
        embedding: Vec<f32>,
        metadata: serde_json::Value,
    ) -> Result<(), IndexError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;

        if let Some(first) = records.iter().find(|r| r.id != id) {
            if first.embedding.len() != embedding.len() {
                return Err(IndexError::Dimension {
                    expected: first.embedding.len(),
                    actual: embedding.len(),
                });
            }
        }

        let record = Record {
            id: id.to_string(),
            embedding,
            metadata,
        };
        match records.iter_mut().find(|r| r.id == id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }

        let mut out = String::new();
        for r in &records {
            out.push_str(&serde_json::to_string(r)?);
            out.push('\n');
        }
        write_atomic(&self.path, out.into_bytes())
            .await
            .map_err(|source| IndexError::Io {
                path: self.path.clone(),
                source,
            })
    }

    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError> {
        let records = self.load().await?;
        let mut scored: HashMap<String, IndexHit> = HashMap::new();
        for r in records {
            if r.embedding.len() != embedding.len() {
                continue;
            }
            let score = cosine(&r.embedding, embedding);
            scored.insert(
                r.id.clone(),
                IndexHit {
                    id: r.id,
                    score,
                    metadata: r.metadata,
                },
            );
        }

        let mut hits: Vec<IndexHit> = scored.into_values().collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upsert_replaces_and_query_ranks() {
        let temp = TempDir::new().unwrap();
        let index = FileIndex::new(temp.path().join("index.jsonl"));

        index.upsert("a", vec![1.0, 0.0], json!({"title": "A"})).await.unwrap();
        index.upsert("b", vec![0.0, 1.0], json!({"title": "B"})).await.unwrap();
        index.upsert("a", vec![0.9, 0.1], json!({"title": "A2"})).await.unwrap();

        let hits = index.query(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[0].metadata["title"], "A2");

        let content = std::fs::read_to_string(index.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let temp = TempDir::new().unwrap();
        let index = FileIndex::new(temp.path().join("index.jsonl"));
        index.upsert("a", vec![1.0, 0.0], json!({})).await.unwrap();
        let err = index.upsert("b", vec![1.0], json!({})).await.unwrap_err();
        assert!(matches!(err, IndexError::Dimension { expected: 2, actual: 1 }));
    }
}
