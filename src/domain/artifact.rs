//! Staged artifacts: the raw text pulled out of a source by Ingest.
//!
//! A staged artifact is persisted on its own, so it survives restarts and
//! lets Refinery run again without repeating extraction.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::work_item::{Identity, WorkKind};

/// Output of the Ingest stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedArtifact {
    /// Work item that produced this artifact
    pub item_id: Uuid,

    /// Source the text was extracted from
    pub identity: Identity,

    pub kind: WorkKind,

    /// Extracted raw text
    pub text: String,

    /// Model used for extraction (None for text layers and plain notes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_model: Option<String>,

    /// Whether the reduced-cost model variant was used
    #[serde(default)]
    pub degraded: bool,

    pub extracted_at: DateTime<Utc>,

    /// Title suggested by the source (file stem, page title, video title)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_hint: Option<String>,

    /// Binary assets pulled from the source, staged next to the artifact
    #[serde(default)]
    pub assets: Vec<PathBuf>,
}

impl StagedArtifact {
    /// Create an artifact extracted now
    pub fn new(item_id: Uuid, identity: Identity, kind: WorkKind, text: String) -> Self {
        Self {
            item_id,
            identity,
            kind,
            text,
            extraction_model: None,
            degraded: false,
            extracted_at: Utc::now(),
            title_hint: None,
            assets: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, degraded: bool) -> Self {
        self.extraction_model = Some(model.into());
        self.degraded = degraded;
        self
    }

    pub fn with_title_hint(mut self, hint: impl Into<String>) -> Self {
        self.title_hint = Some(hint.into());
        self
    }

    pub fn with_assets(mut self, assets: Vec<PathBuf>) -> Self {
        self.assets = assets;
        self
    }

    /// Whether extraction produced nothing usable
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Date relative expressions ("by Friday") are resolved against
    pub fn reference_date(&self) -> NaiveDate {
        self.extracted_at.date_naive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_json_roundtrip_keeps_provenance() {
        let artifact = StagedArtifact::new(
            Uuid::new_v4(),
            Identity::Path(PathBuf::from("/drop/scan.png")),
            WorkKind::Document,
            "hello".to_string(),
        )
        .with_model("tesseract:eng", false)
        .with_assets(vec![PathBuf::from("/staged/x/scan.png")]);

        let json = serde_json::to_string(&artifact).unwrap();
        let parsed: StagedArtifact = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.extraction_model.as_deref(), Some("tesseract:eng"));
        assert_eq!(parsed.assets.len(), 1);
        assert!(!parsed.is_empty());
    }

    #[test]
    fn test_whitespace_only_is_empty() {
        let artifact = StagedArtifact::new(
            Uuid::new_v4(),
            Identity::Url("https://example.com".into()),
            WorkKind::Link,
            " \n\t".into(),
        );
        assert!(artifact.is_empty());
    }
}
