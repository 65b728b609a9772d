//! Tesseract OCR runtime. The model id is the tesseract language set
//! (`eng`, `pol+eng`, ...).

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::extract::run_tool;
use super::whisper::tool_error;
use super::{ModelError, ModelKind, ModelRequest, ModelResponse, ModelRuntime};

pub struct TesseractRuntime {
    binary_path: String,
    timeout: Duration,
}

impl TesseractRuntime {
    pub fn new(binary_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary_path: binary_path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ModelRuntime for TesseractRuntime {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn load(&self, _kind: ModelKind, _model: &str) -> Result<(), ModelError> {
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
        let ModelRequest::Ocr { path, .. } = request else {
            return Err(ModelError::Unsupported {
                kind,
                detail: "tesseract only serves OCR".to_string(),
            });
        };

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg(&path)
            .arg("stdout")
            .arg("-l")
            .arg(model)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = run_tool("tesseract", &mut cmd, self.timeout)
            .await
            .map_err(|e| tool_error(model, e))?;

        Ok(ModelResponse::Text(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }

    async fn health_check(&self) -> Result<(), ModelError> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("--version").stdout(Stdio::null()).stderr(Stdio::null());
        run_tool("tesseract", &mut cmd, Duration::from_secs(30))
            .await
            .map(|_| ())
            .map_err(|e| tool_error("tesseract", e))
    }
}
