//! Ingest stage: source → raw text.
//!
//! | Input            | Extraction                                  | Lease         |
//! |------------------|---------------------------------------------|---------------|
//! | Note (txt/md)    | read file                                   | none          |
//! | Audio/video      | transcribe                                  | Transcription |
//! | PDF              | text layer, OCR of rendered pages if empty  | Ocr if needed |
//! | Image            | OCR, image kept as asset                    | Ocr           |
//! | Video link       | yt-dlp audio, transcribe                    | Transcription |
//! | Other link       | HTTP fetch, readable text                   | none          |
//!
//! Any lease is released before the artifact is checkpointed.

use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use super::checkpoint::CheckpointStore;
use super::stage::StageError;
use crate::adapters::extract::{is_video_url, Extractors};
use crate::adapters::{ModelKind, ModelRequest};
use crate::domain::{Identity, StagedArtifact, WorkItem, WorkKind};
use crate::ingest::{document_format, DocumentFormat};
use crate::resources::{AcquireMode, ResourceManager};

/// PDF text layers shorter than this are treated as scans
const MIN_TEXT_LAYER_CHARS: usize = 50;

#[derive(Debug, Default)]
struct Extraction {
    text: String,
    model: Option<String>,
    degraded: bool,
    title_hint: Option<String>,
    assets: Vec<PathBuf>,
}

pub struct IngestStage {
    resources: ResourceManager,
    extractors: Extractors,
    checkpoints: CheckpointStore,
    language: Option<String>,
}

impl IngestStage {
    pub fn new(
        resources: ResourceManager,
        extractors: Extractors,
        checkpoints: CheckpointStore,
        language: Option<String>,
    ) -> Self {
        Self {
            resources,
            extractors,
            checkpoints,
            language,
        }
    }

    /// Extract and checkpoint the raw text of `item` (one attempt)
    #[instrument(skip(self, item), fields(item = %item.short_id(), kind = %item.kind))]
    pub async fn run(&self, item: &WorkItem) -> Result<StagedArtifact, StageError> {
        let extraction = match (&item.identity, item.kind) {
            (Identity::Path(path), WorkKind::Note) => self.read_note(path).await?,
            (Identity::Path(path), WorkKind::Audio) => {
                ensure_exists(path).await?;
                let mut extraction = self.transcribe(path.clone()).await?;
                extraction.title_hint = file_stem(path);
                extraction
            }
            (Identity::Path(path), WorkKind::Document) => self.document(item, path).await?,
            (Identity::Url(url), WorkKind::Link) => self.link(url).await?,
            (identity, kind) => {
                return Err(StageError::Unsupported(format!(
                    "{} input from {}",
                    kind, identity
                )))
            }
        };

        let mut artifact =
            StagedArtifact::new(item.id, item.identity.clone(), item.kind, extraction.text)
                .with_assets(extraction.assets);
        if let Some(model) = extraction.model {
            artifact = artifact.with_model(model, extraction.degraded);
        }
        if let Some(hint) = extraction.title_hint {
            artifact = artifact.with_title_hint(hint);
        }

        self.checkpoints.save_artifact(&artifact).await?;

        info!(
            chars = artifact.text.chars().count(),
            model = artifact.extraction_model.as_deref().unwrap_or("-"),
            degraded = artifact.degraded,
            assets = artifact.assets.len(),
            "Staged artifact"
        );
        Ok(artifact)
    }

    async fn read_note(&self, path: &Path) -> Result<Extraction, StageError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StageError::source_io(path, e))?;
        Ok(Extraction {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            title_hint: file_stem(path),
            ..Default::default()
        })
    }

    async fn document(&self, item: &WorkItem, path: &Path) -> Result<Extraction, StageError> {
        ensure_exists(path).await?;
        let assets_dir = self.checkpoints.assets_dir(item.id);

        match document_format(path) {
            Some(DocumentFormat::Pdf) => self.pdf(path, &assets_dir).await,
            Some(DocumentFormat::Image) => {
                let name = path
                    .file_name()
                    .ok_or_else(|| StageError::Unsupported(path.display().to_string()))?;
                tokio::fs::create_dir_all(&assets_dir)
                    .await
                    .map_err(|e| StageError::source_io(&assets_dir, e))?;
                let asset = assets_dir.join(name);
                tokio::fs::copy(path, &asset)
                    .await
                    .map_err(|e| StageError::source_io(path, e))?;

                let mut extraction = self
                    .run_model(
                        ModelKind::Ocr,
                        vec![ModelRequest::Ocr {
                            path: asset.clone(),
                            language: self.language.clone(),
                        }],
                    )
                    .await?;
                extraction.title_hint = file_stem(path);
                extraction.assets = vec![asset];
                Ok(extraction)
            }
            None => Err(StageError::Unsupported(format!(
                "unrecognised document format: {}",
                path.display()
            ))),
        }
    }

    async fn pdf(&self, path: &Path, assets_dir: &Path) -> Result<Extraction, StageError> {
        let text_layer = self.extractors.pdf_text(path).await?;

        let assets = match self.extractors.pdf_images(path, assets_dir).await {
            Ok(images) => images,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not pull embedded images");
                Vec::new()
            }
        };

        let mut extraction = if text_layer.trim().chars().count() >= MIN_TEXT_LAYER_CHARS {
            Extraction {
                text: text_layer,
                ..Default::default()
            }
        } else {
            debug!(path = %path.display(), "Empty text layer, falling back to OCR");
            let scratch = tempfile::tempdir().map_err(|e| StageError::TransientIo {
                context: "page render directory".to_string(),
                source: e,
            })?;
            let pages = self.extractors.render_pages(path, scratch.path()).await?;
            if pages.is_empty() {
                return Err(StageError::Unsupported(format!(
                    "no pages rendered from {}",
                    path.display()
                )));
            }
            let requests = pages
                .into_iter()
                .map(|page| ModelRequest::Ocr {
                    path: page,
                    language: self.language.clone(),
                })
                .collect();
            self.run_model(ModelKind::Ocr, requests).await?
        };

        extraction.title_hint = file_stem(path);
        extraction.assets = assets;
        Ok(extraction)
    }

    async fn link(&self, url: &str) -> Result<Extraction, StageError> {
        if is_video_url(url) {
            let scratch = tempfile::tempdir().map_err(|e| StageError::TransientIo {
                context: "download directory".to_string(),
                source: e,
            })?;
            let audio = self.extractors.download_audio(url, scratch.path()).await?;
            let mut extraction = self.transcribe(audio.clone()).await?;
            extraction.title_hint = file_stem(&audio);
            return Ok(extraction);
        }

        let (title, text) = self.extractors.fetch_article(url).await?;
        Ok(Extraction {
            text,
            title_hint: title,
            ..Default::default()
        })
    }

    async fn transcribe(&self, path: PathBuf) -> Result<Extraction, StageError> {
        self.run_model(
            ModelKind::Transcription,
            vec![ModelRequest::Transcribe {
                path,
                language: self.language.clone(),
            }],
        )
        .await
    }

    /// Run `requests` in order under one scoped lease
    async fn run_model(
        &self,
        kind: ModelKind,
        requests: Vec<ModelRequest>,
    ) -> Result<Extraction, StageError> {
        self.resources
            .scoped(kind, AcquireMode::Wait, move |lease| {
                Box::pin(async move {
                    let mut parts = Vec::with_capacity(requests.len());
                    for request in requests {
                        let text = lease.invoke(request).await?.into_text()?;
                        let text = text.trim();
                        if !text.is_empty() {
                            parts.push(text.to_string());
                        }
                    }
                    Ok(Extraction {
                        text: parts.join("\n\n"),
                        model: Some(lease.model().to_string()),
                        degraded: lease.is_degraded(),
                        ..Default::default()
                    })
                })
            })
            .await
    }
}

async fn ensure_exists(path: &Path) -> Result<(), StageError> {
    tokio::fs::metadata(path)
        .await
        .map(|_| ())
        .map_err(|e| StageError::source_io(path, e))
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().trim().to_string())
        .filter(|s| !s.is_empty())
}
