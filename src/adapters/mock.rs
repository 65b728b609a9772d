//! In-memory model runtime for tests.
//!
//! Tracks which models are resident, records every call, and lets a test
//! script failures (including out-of-memory on load) and slow invocations.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::{ModelError, ModelKind, ModelRequest, ModelResponse, ModelRuntime};

/// Default resident size of a mock model
const DEFAULT_MODEL_BYTES: u64 = 1000;

/// Embedding width produced by the mock
const EMBEDDING_DIM: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Load,
    Unload,
    Invoke,
}

/// One recorded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub kind: ModelKind,
    pub model: String,
}

#[derive(Default)]
struct MockState {
    resident: HashMap<String, u64>,
    peak_resident_count: usize,
    peak_resident_bytes: u64,
    calls: Vec<MockCall>,
    failures: HashMap<ModelKind, VecDeque<ModelError>>,
}

#[derive(Default)]
pub struct MockRuntime {
    sizes: HashMap<String, u64>,
    texts: HashMap<ModelKind, String>,
    oom_on_load: HashSet<String>,
    delays: HashMap<ModelKind, Duration>,
    unhealthy: bool,
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resident cost reported for `model`
    pub fn with_model_size(mut self, model: impl Into<String>, bytes: u64) -> Self {
        self.sizes.insert(model.into(), bytes);
        self
    }

    /// Fixed text returned for every invocation of `kind`
    pub fn with_text(mut self, kind: ModelKind, text: impl Into<String>) -> Self {
        self.texts.insert(kind, text.into());
        self
    }

    /// Loading `model` always fails with out-of-memory
    pub fn with_oom_on_load(mut self, model: impl Into<String>) -> Self {
        self.oom_on_load.insert(model.into());
        self
    }

    /// Every invocation of `kind` sleeps before answering
    pub fn with_invoke_delay(mut self, kind: ModelKind, delay: Duration) -> Self {
        self.delays.insert(kind, delay);
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.unhealthy = true;
        self
    }

    /// The next `times` invocations of `kind` fail with `error`
    pub fn fail_next(&self, kind: ModelKind, error: ModelError, times: usize) {
        let mut state = self.lock();
        let queue = state.failures.entry(kind).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn resident_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.lock().resident.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn resident_bytes(&self) -> u64 {
        self.lock().resident.values().sum()
    }

    /// Most models ever resident at the same time
    pub fn max_concurrent_resident(&self) -> usize {
        self.lock().peak_resident_count
    }

    pub fn peak_resident_bytes(&self) -> u64 {
        self.lock().peak_resident_bytes
    }

    pub fn invoke_count(&self, kind: ModelKind) -> usize {
        self.count(|c| c.op == MockOp::Invoke && c.kind == kind)
    }

    pub fn load_count(&self) -> usize {
        self.count(|c| c.op == MockOp::Load)
    }

    pub fn unload_count(&self) -> usize {
        self.count(|c| c.op == MockOp::Unload)
    }

    fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, op: MockOp, kind: ModelKind, model: &str) {
        self.lock().calls.push(MockCall {
            op,
            kind,
            model: model.to_string(),
        });
    }

    async fn default_response(
        &self,
        kind: ModelKind,
        request: ModelRequest,
    ) -> Result<ModelResponse, ModelError> {
        if let Some(text) = self.texts.get(&kind) {
            return Ok(match request {
                ModelRequest::Embed { .. } => ModelResponse::Embedding(embed(text)),
                _ => ModelResponse::Text(text.clone()),
            });
        }

        match request {
            ModelRequest::Transcribe { path, .. } | ModelRequest::Ocr { path, .. } => {
                let text = tokio::fs::read(&path)
                    .await
                    .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
                    .unwrap_or_default();
                if text.is_empty() {
                    Ok(ModelResponse::Text(format!(
                        "{} of {}",
                        kind,
                        path.file_name().unwrap_or_default().to_string_lossy()
                    )))
                } else {
                    Ok(ModelResponse::Text(text))
                }
            }
            ModelRequest::Generate { prompt, .. } => {
                let body = if kind == ModelKind::Classification {
                    json!({ "folder": null, "confidence": 0.0, "tags": [] })
                } else {
                    json!({
                        "title": "",
                        "summary": format!("Summary of {} characters.", prompt.chars().count()),
                        "sections": [],
                        "action_items": [],
                        "tags": [],
                    })
                };
                Ok(ModelResponse::Text(body.to_string()))
            }
            ModelRequest::Embed { text } => Ok(ModelResponse::Embedding(embed(&text))),
        }
    }
}

/// Deterministic bag-of-words embedding, L2 normalised
fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIM];
    for word in text.split_whitespace() {
        let digest = Sha256::digest(word.to_lowercase().as_bytes());
        vector[digest[0] as usize % EMBEDDING_DIM] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

#[async_trait]
impl ModelRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn load(&self, kind: ModelKind, model: &str) -> Result<(), ModelError> {
        self.record(MockOp::Load, kind, model);
        if self.oom_on_load.contains(model) {
            return Err(ModelError::OutOfMemory {
                model: model.to_string(),
                detail: "mock device exhausted".to_string(),
            });
        }

        let bytes = self.sizes.get(model).copied().unwrap_or(DEFAULT_MODEL_BYTES);
        let mut state = self.lock();
        state.resident.insert(model.to_string(), bytes);
        let count = state.resident.len();
        let total: u64 = state.resident.values().sum();
        state.peak_resident_count = state.peak_resident_count.max(count);
        state.peak_resident_bytes = state.peak_resident_bytes.max(total);
        Ok(())
    }

    async fn unload(&self, kind: ModelKind, model: &str) -> Result<(), ModelError> {
        self.record(MockOp::Unload, kind, model);
        self.lock().resident.remove(model);
        Ok(())
    }

    async fn invoke(
        &self,
        kind: ModelKind,
        model: &str,
        request: ModelRequest,
    ) -> Result<ModelResponse, ModelError> {
        self.record(MockOp::Invoke, kind, model);

        let scripted = {
            let mut state = self.lock();
            if !state.resident.contains_key(model) {
                return Err(ModelError::Invocation(format!(
                    "model {} is not loaded",
                    model
                )));
            }
            state.failures.get_mut(&kind).and_then(VecDeque::pop_front)
        };

        if let Some(delay) = self.delays.get(&kind) {
            tokio::time::sleep(*delay).await;
        }

        if let Some(error) = scripted {
            return Err(error);
        }

        self.default_response(kind, request).await
    }

    async fn health_check(&self) -> Result<(), ModelError> {
        if self.unhealthy {
            return Err(ModelError::Unavailable("mock marked unhealthy".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invoke_requires_load() {
        let runtime = MockRuntime::new();
        let request = ModelRequest::Embed { text: "a b".into() };

        let err = runtime
            .invoke(ModelKind::Embedding, "e", request.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Invocation(_)));

        runtime.load(ModelKind::Embedding, "e").await.unwrap();
        let vector = runtime
            .invoke(ModelKind::Embedding, "e", request)
            .await
            .unwrap()
            .into_embedding()
            .unwrap();
        assert_eq!(vector.len(), EMBEDDING_DIM);

        runtime.unload(ModelKind::Embedding, "e").await.unwrap();
        assert!(runtime.resident_models().is_empty());
        assert_eq!(runtime.max_concurrent_resident(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failures_drain() {
        let runtime = MockRuntime::new().with_text(ModelKind::Generation, "ok");
        runtime.load(ModelKind::Generation, "g").await.unwrap();
        runtime.fail_next(ModelKind::Generation, ModelError::Timeout(1), 1);

        let request = ModelRequest::Generate {
            system: String::new(),
            prompt: "p".into(),
            json: false,
        };
        assert!(runtime
            .invoke(ModelKind::Generation, "g", request.clone())
            .await
            .is_err());
        let text = runtime
            .invoke(ModelKind::Generation, "g", request)
            .await
            .unwrap()
            .into_text()
            .unwrap();
        assert_eq!(text, "ok");
        assert_eq!(runtime.invoke_count(ModelKind::Generation), 2);
    }

    #[tokio::test]
    async fn test_oom_on_load() {
        let runtime = MockRuntime::new().with_oom_on_load("big");
        let err = runtime.load(ModelKind::Transcription, "big").await.unwrap_err();
        assert!(err.is_out_of_memory());
        assert!(runtime.resident_models().is_empty());
    }

    #[test]
    fn test_embedding_is_deterministic() {
        assert_eq!(embed("hello world"), embed("Hello World"));
        assert_ne!(embed("hello"), embed("tax invoice due"));
    }
}
