//! Model runtime interfaces.
//!
//! Transcription, OCR, generation and embedding engines are opaque services
//! behind [`ModelRuntime`]. The pipeline never talks to an engine directly:
//! it goes through a lease from the resource manager, which drives
//! `load`/`unload` around every use.
//!
//! ```text
//!   ResourceManager ──load/unload──┐
//!                                  ▼
//!   ModelLease ──invoke──► ModelRuntime ─┬─ OllamaRuntime    (HTTP)
//!                                        ├─ WhisperRuntime   (subprocess)
//!                                        ├─ TesseractRuntime (subprocess)
//!                                        ├─ CompositeRuntime (routes by kind)
//!                                        └─ MockRuntime      (tests)
//! ```

pub mod composite;
pub mod extract;
pub mod mock;
pub mod ollama;
pub mod tesseract;
pub mod whisper;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use composite::CompositeRuntime;
pub use mock::MockRuntime;
pub use ollama::OllamaRuntime;
pub use tesseract::TesseractRuntime;
pub use whisper::WhisperRuntime;

/// What a model is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Transcription,
    Ocr,
    Generation,
    Embedding,
    Classification,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::Ocr => "ocr",
            Self::Generation => "generation",
            Self::Embedding => "embedding",
            Self::Classification => "classification",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single request to a loaded model
#[derive(Debug, Clone)]
pub enum ModelRequest {
    /// Speech to text for an audio/video file
    Transcribe {
        path: PathBuf,
        language: Option<String>,
    },

    /// Image to text
    Ocr {
        path: PathBuf,
        language: Option<String>,
    },

    /// Text generation; `json` asks the runtime to constrain output to JSON
    Generate {
        system: String,
        prompt: String,
        json: bool,
    },

    /// Text embedding
    Embed { text: String },
}

impl ModelRequest {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transcribe { .. } => "transcribe",
            Self::Ocr { .. } => "ocr",
            Self::Generate { .. } => "generate",
            Self::Embed { .. } => "embed",
        }
    }
}

/// Result of a model call
#[derive(Debug, Clone, PartialEq)]
pub enum ModelResponse {
    Text(String),
    Embedding(Vec<f32>),
}

impl ModelResponse {
    pub fn into_text(self) -> Result<String, ModelError> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Embedding(_) => Err(ModelError::Malformed(
                "expected text, got embedding".to_string(),
            )),
        }
    }

    pub fn into_embedding(self) -> Result<Vec<f32>, ModelError> {
        match self {
            Self::Embedding(v) => Ok(v),
            Self::Text(_) => Err(ModelError::Malformed(
                "expected embedding, got text".to_string(),
            )),
        }
    }
}

/// Errors reported by model runtimes
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("Out of device memory for model {model}: {detail}")]
    OutOfMemory { model: String, detail: String },

    #[error("Model runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Model invocation failed: {0}")]
    Invocation(String),

    #[error("Malformed model output: {0}")]
    Malformed(String),

    #[error("Model call timed out after {0}s")]
    Timeout(u64),

    #[error("Unsupported {kind} request: {detail}")]
    Unsupported { kind: ModelKind, detail: String },
}

impl ModelError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Whether repeating the same call can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unsupported { .. })
    }

    /// Classify an engine error message, recognising device memory failures
    pub fn from_engine_message(model: &str, message: &str) -> Self {
        let lower = message.to_lowercase();
        let oom = [
            "out of memory",
            "oom-kill",
            "requires more system memory",
            "failed to allocate",
        ]
        .iter()
        .any(|needle| lower.contains(needle));
        if oom {
            Self::OutOfMemory {
                model: model.to_string(),
                detail: message.trim().chars().take(300).collect(),
            }
        } else {
            Self::Invocation(message.trim().chars().take(500).collect())
        }
    }
}

/// Trait for model runtimes
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Human-readable runtime name
    fn name(&self) -> &str;

    /// Make `model` resident
    async fn load(&self, kind: ModelKind, model: &str) -> Result<(), ModelError>;

    /// Evict `model` and free its device memory
    async fn unload(&self, kind: ModelKind, model: &str) -> Result<(), ModelError>;

    /// Run one request against a loaded model
    async fn invoke(
        &self,
        kind: ModelKind,
        model: &str,
        request: ModelRequest,
    ) -> Result<ModelResponse, ModelError>;

    /// Check the runtime is reachable
    async fn health_check(&self) -> Result<(), ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_message_classification() {
        let oom = ModelError::from_engine_message("m", "RuntimeError: CUDA out of memory. Tried to allocate");
        assert!(oom.is_out_of_memory());

        let other = ModelError::from_engine_message("m", "file not found");
        assert!(matches!(other, ModelError::Invocation(_)));
        assert!(other.is_retryable());
    }

    #[test]
    fn test_response_conversion() {
        assert_eq!(ModelResponse::Text("a".into()).into_text().unwrap(), "a");
        assert!(ModelResponse::Text("a".into()).into_embedding().is_err());
    }
}
