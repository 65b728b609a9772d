//! Ollama model runtime (HTTP).
//!
//! - load: `/api/generate` with an empty prompt and a keep-alive
//! - unload: `/api/generate` with `keep_alive: 0`
//! - generation: `/api/chat`, optionally constrained to JSON
//! - embeddings: `/api/embed`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{ModelError, ModelKind, ModelRequest, ModelResponse, ModelRuntime};

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// How long a loaded model stays resident between calls of one lease
const LEASE_KEEP_ALIVE: &str = "30m";

pub struct OllamaRuntime {
    client: Client,
    base_url: String,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

impl OllamaRuntime {
    /// Create a runtime against `base_url` with a per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }

    /// Create from OLLAMA_BASE (or the default URL)
    pub fn from_env(timeout: Duration) -> Result<Self, ModelError> {
        let base_url =
            std::env::var("OLLAMA_BASE").unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string());
        Self::new(base_url, timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, path: &str, model: &str, body: serde_json::Value) -> Result<String, ModelError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    ModelError::Unavailable(format!("{}: {}", self.base_url, e))
                } else {
                    ModelError::Invocation(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ModelError::Invocation(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or(text);
            return Err(ModelError::from_engine_message(model, &format!("HTTP {}: {}", status, message)));
        }

        Ok(text)
    }
}

#[async_trait]
impl ModelRuntime for OllamaRuntime {
    fn name(&self) -> &str {
        "ollama"
    }

    #[instrument(skip(self), fields(runtime = "ollama"))]
    async fn load(&self, kind: ModelKind, model: &str) -> Result<(), ModelError> {
        let body = match kind {
            ModelKind::Embedding => json!({ "model": model, "input": "", "keep_alive": LEASE_KEEP_ALIVE }),
            _ => json!({ "model": model, "prompt": "", "keep_alive": LEASE_KEEP_ALIVE }),
        };
        let path = if kind == ModelKind::Embedding { "/api/embed" } else { "/api/generate" };
        self.post(path, model, body).await?;
        debug!("Model loaded");
        Ok(())
    }

    #[instrument(skip(self), fields(runtime = "ollama"))]
    async fn unload(&self, kind: ModelKind, model: &str) -> Result<(), ModelError> {
        let body = match kind {
            ModelKind::Embedding => json!({ "model": model, "input": "", "keep_alive": 0 }),
            _ => json!({ "model": model, "prompt": "", "keep_alive": 0 }),
        };
        let path = if kind == ModelKind::Embedding { "/api/embed" } else { "/api/generate" };
        self.post(path, model, body).await?;
        debug!("Model unloaded");
        Ok(())
    }

    async fn invoke(
        &self,
        kind: ModelKind,
        model: &str,
        request: ModelRequest,
    ) -> Result<ModelResponse, ModelError> {
        match request {
            ModelRequest::Generate {
                system,
                prompt,
                json,
            } => {
                let mut body = json!({
                    "model": model,
                    "stream": false,
                    "keep_alive": LEASE_KEEP_ALIVE,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": prompt },
                    ],
                    "options": { "temperature": 0.2 },
                });
                if json {
                    body["format"] = json!("json");
                }
                let text = self.post("/api/chat", model, body).await?;
                let parsed: ChatResponse = serde_json::from_str(&text)
                    .map_err(|e| ModelError::Malformed(format!("chat response: {}", e)))?;
                Ok(ModelResponse::Text(parsed.message.content))
            }
            ModelRequest::Embed { text } => {
                let body = json!({ "model": model, "input": text, "keep_alive": LEASE_KEEP_ALIVE });
                let text = self.post("/api/embed", model, body).await?;
                let parsed: EmbedResponse = serde_json::from_str(&text)
                    .map_err(|e| ModelError::Malformed(format!("embed response: {}", e)))?;
                parsed
                    .embeddings
                    .into_iter()
                    .next()
                    .map(ModelResponse::Embedding)
                    .ok_or_else(|| ModelError::Malformed("no embedding returned".to_string()))
            }
            other => Err(ModelError::Unsupported {
                kind,
                detail: format!("ollama cannot serve '{}'", other.label()),
            }),
        }
    }

    async fn health_check(&self) -> Result<(), ModelError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ModelError::Unavailable(format!("{}: {}", self.base_url, e)))?;
        if !response.status().is_success() {
            return Err(ModelError::Unavailable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}
