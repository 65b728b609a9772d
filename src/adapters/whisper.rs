//! Whisper transcription runtime.
//!
//! Shells out to a local whisper binary. Each invocation is its own process,
//! so the model is resident only while the process runs and `load`/`unload`
//! only verify the binary is reachable.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::extract::{run_tool, ExtractError};
use super::{ModelError, ModelKind, ModelRequest, ModelResponse, ModelRuntime};

/// Result of transcription
#[derive(Debug, Clone)]
pub struct TranscriptResult {
    pub text: String,
    pub language: String,
    pub duration_seconds: f64,
}

/// Whisper output JSON structure
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    text: String,
    #[serde(default)]
    language: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    end: f64,
}

/// Whisper runtime using subprocess mode
pub struct WhisperRuntime {
    binary_path: String,
    timeout: Duration,
}

impl WhisperRuntime {
    pub fn new(binary_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary_path: binary_path.into(),
            timeout,
        }
    }

    /// Transcribe audio with the given whisper model
    pub async fn transcribe(
        &self,
        audio_path: &Path,
        model: &str,
        language: Option<&str>,
    ) -> Result<TranscriptResult, ModelError> {
        // Create temp dir for output
        let temp_dir = tempfile::tempdir()
            .map_err(|e| ModelError::Invocation(format!("Failed to create temp dir: {}", e)))?;

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg(audio_path)
            .arg("--model")
            .arg(model)
            .arg("--output_dir")
            .arg(temp_dir.path())
            .arg("--output_format")
            .arg("json")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(lang) = language {
            cmd.arg("--language").arg(lang);
        }

        run_tool("whisper", &mut cmd, self.timeout)
            .await
            .map_err(|e| tool_error(model, e))?;

        // Find and parse JSON output
        let stem = audio_path.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = temp_dir.path().join(format!("{}.json", stem));

        let json_content = tokio::fs::read_to_string(&json_path)
            .await
            .map_err(|e| ModelError::Malformed(format!("Failed to read whisper output: {}", e)))?;

        parse_output(&json_content)
    }
}

fn parse_output(json_content: &str) -> Result<TranscriptResult, ModelError> {
    let whisper: WhisperOutput = serde_json::from_str(json_content)
        .map_err(|e| ModelError::Malformed(format!("Failed to parse whisper JSON: {}", e)))?;

    let duration = whisper.segments.last().map(|s| s.end).unwrap_or(0.0);

    Ok(TranscriptResult {
        text: whisper.text.trim().to_string(),
        language: whisper.language,
        duration_seconds: duration,
    })
}

/// Map a subprocess failure onto the model error taxonomy
pub(crate) fn tool_error(model: &str, error: ExtractError) -> ModelError {
    match error {
        ExtractError::Spawn { tool, source } => {
            ModelError::Unavailable(format!("{}: {}", tool, source))
        }
        ExtractError::Timeout { secs, .. } => ModelError::Timeout(secs),
        ExtractError::Failed { stderr, .. } => ModelError::from_engine_message(model, &stderr),
        other => ModelError::Invocation(other.to_string()),
    }
}

#[async_trait]
impl ModelRuntime for WhisperRuntime {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn load(&self, _kind: ModelKind, _model: &str) -> Result<(), ModelError> {
        // Weights load inside each whisper process
        Ok(())
    }

    async fn unload(&self, _kind: ModelKind, _model: &str) -> Result<(), ModelError> {
        Ok(())
    }

    async fn invoke(
        &self,
        kind: ModelKind,
        model: &str,
        request: ModelRequest,
    ) -> Result<ModelResponse, ModelError> {
        match request {
            ModelRequest::Transcribe { path, language } => {
                let result = self.transcribe(&path, model, language.as_deref()).await?;
                tracing::debug!(
                    language = %result.language,
                    duration_seconds = result.duration_seconds,
                    "Transcription finished"
                );
                Ok(ModelResponse::Text(result.text))
            }
            other => Err(ModelError::Unsupported {
                kind,
                detail: format!("whisper cannot serve '{}'", other.label()),
            }),
        }
    }

    async fn health_check(&self) -> Result<(), ModelError> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("--help").stdout(Stdio::null()).stderr(Stdio::null());
        run_tool("whisper", &mut cmd, Duration::from_secs(30))
            .await
            .map(|_| ())
            .map_err(|e| tool_error("whisper", e))
    }
}
