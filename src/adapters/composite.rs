//! Routes each model kind to the runtime that serves it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{ModelError, ModelKind, ModelRequest, ModelResponse, ModelRuntime};

pub struct CompositeRuntime {
    fallback: Arc<dyn ModelRuntime>,
    routes: HashMap<ModelKind, Arc<dyn ModelRuntime>>,
}

impl CompositeRuntime {
    /// Kinds without an explicit route go to `fallback`
    pub fn new(fallback: Arc<dyn ModelRuntime>) -> Self {
        Self {
            fallback,
            routes: HashMap::new(),
        }
    }

    pub fn route(mut self, kind: ModelKind, runtime: Arc<dyn ModelRuntime>) -> Self {
        self.routes.insert(kind, runtime);
        self
    }

    fn runtime_for(&self, kind: ModelKind) -> &Arc<dyn ModelRuntime> {
        self.routes.get(&kind).unwrap_or(&self.fallback)
    }
}

#[async_trait]
impl ModelRuntime for CompositeRuntime {
    fn name(&self) -> &str {
        "composite"
    }

    async fn load(&self, kind: ModelKind, model: &str) -> Result<(), ModelError> {
        self.runtime_for(kind).load(kind, model).await
    }

    async fn unload(&self, kind: ModelKind, model: &str) -> Result<(), ModelError> {
        self.runtime_for(kind).unload(kind, model).await
    }

    async fn invoke(
        &self,
        kind: ModelKind,
        model: &str,
        request: ModelRequest,
    ) -> Result<ModelResponse, ModelError> {
        self.runtime_for(kind).invoke(kind, model, request).await
    }

    /// Every distinct runtime must be healthy
    async fn health_check(&self) -> Result<(), ModelError> {
        self.fallback.health_check().await?;
        let mut checked: Vec<&str> = vec![self.fallback.name()];
        for runtime in self.routes.values() {
            if checked.contains(&runtime.name()) {
                continue;
            }
            runtime.health_check().await?;
            checked.push(runtime.name());
        }
        Ok(())
    }
}
