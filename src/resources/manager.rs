//! Heavy-model slot and model leases.
//!
//! Only one heavy model may be resident at a time, across every task in this
//! process and every process sharing the same home directory. The slot is a
//! one-permit semaphore plus an exclusive advisory lock on
//! `<home>/heavy-slot.lock`. A [`ModelLease`] owns the slot from `load` until
//! `unload` has completed.

use std::fs::OpenOptions;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, instrument, warn};

use crate::adapters::{ModelError, ModelKind, ModelRequest, ModelResponse, ModelRuntime};
use crate::config::ModelsSettings;

/// Whether `acquire` waits for the slot or gives up immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquireMode {
    #[default]
    Wait,
    FailFast,
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Heavy model slot is busy (requested {kind})")]
    Busy { kind: ModelKind },

    #[error("Device memory exhausted for {kind} model {model}: {detail}")]
    Exhausted {
        kind: ModelKind,
        model: String,
        detail: String,
    },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Slot lock failed: {0}")]
    Lock(String),

    #[error("Resource manager closed")]
    Closed,
}

impl ResourceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Busy { .. } | Self::Lock(_) => true,
            Self::Model(e) => e.is_retryable(),
            Self::Exhausted { .. } | Self::Closed => false,
        }
    }
}

/// Future returned by the body of [`ResourceManager::scoped`]
pub type LeaseFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Holds the heavy slot; frees it on drop
struct SlotGuard {
    _permit: OwnedSemaphorePermit,
    lock_file: Option<std::fs::File>,
    outstanding: Arc<AtomicUsize>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.lock_file {
            if let Err(e) = FileExt::unlock(file) {
                warn!(error = %e, "Failed to unlock heavy slot file");
            }
        }
        // Decrement before the permit is returned
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive use of one loaded model
pub struct ModelLease {
    kind: ModelKind,
    model: String,
    fallback: Option<(String, u64)>,
    acquired_at: DateTime<Utc>,
    estimated_bytes: u64,
    degraded: bool,
    waited: Duration,
    runtime: Arc<dyn ModelRuntime>,
    guard: Option<SlotGuard>,
    released: bool,
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("acquired_at", &self.acquired_at)
            .field("estimated_bytes", &self.estimated_bytes)
            .field("degraded", &self.degraded)
            .field("heavy", &self.guard.is_some())
            .finish()
    }
}

impl ModelLease {
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Identifier actually loaded (the fallback once degraded)
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn estimated_bytes(&self) -> u64 {
        self.estimated_bytes
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn is_heavy(&self) -> bool {
        self.guard.is_some()
    }

    /// Time spent waiting for the slot
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Run one request; an out-of-memory failure switches to the fallback once
    pub async fn invoke(&mut self, request: ModelRequest) -> Result<ModelResponse, ResourceError> {
        if self.released {
            return Err(ResourceError::Closed);
        }

        match self
            .runtime
            .invoke(self.kind, &self.model, request.clone())
            .await
        {
            Ok(response) => Ok(response),
            Err(e) if e.is_out_of_memory() => {
                self.degrade(e).await?;
                self.runtime
                    .invoke(self.kind, &self.model, request)
                    .await
                    .map_err(|e| self.exhausted_or(e))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Unload the current model and load the fallback variant
    async fn degrade(&mut self, cause: ModelError) -> Result<(), ResourceError> {
        let Some((fallback, bytes)) = self.fallback.take() else {
            return Err(ResourceError::Exhausted {
                kind: self.kind,
                model: self.model.clone(),
                detail: cause.to_string(),
            });
        };

        warn!(
            kind = %self.kind,
            model = %self.model,
            fallback = %fallback,
            error = %cause,
            "Out of device memory, retrying with smaller model"
        );

        if let Err(e) = self.runtime.unload(self.kind, &self.model).await {
            warn!(model = %self.model, error = %e, "Unload before fallback failed");
        }

        self.model = fallback;
        self.estimated_bytes = bytes;
        self.degraded = true;

        self.runtime
            .load(self.kind, &self.model)
            .await
            .map_err(|e| self.exhausted_or(e))
    }

    fn exhausted_or(&self, error: ModelError) -> ResourceError {
        if error.is_out_of_memory() {
            ResourceError::Exhausted {
                kind: self.kind,
                model: self.model.clone(),
                detail: error.to_string(),
            }
        } else {
            error.into()
        }
    }

    /// Unload, then free the slot
    async fn shutdown(&mut self) -> Result<(), ModelError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let result = self.runtime.unload(self.kind, &self.model).await;
        self.guard.take();
        result
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        warn!(kind = %self.kind, model = %self.model, "Lease dropped without release, unloading");

        let guard = self.guard.take();
        let runtime = self.runtime.clone();
        let kind = self.kind;
        let model = std::mem::take(&mut self.model);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = runtime.unload(kind, &model).await {
                        warn!(%kind, %model, error = %e, "Unload of dropped lease failed");
                    }
                    // The slot stays taken until the unload has finished
                    drop(guard);
                });
            }
            Err(_) => drop(guard),
        }
    }
}

/// Leases heavy models one at a time
#[derive(Clone)]
pub struct ResourceManager {
    runtime: Arc<dyn ModelRuntime>,
    models: ModelsSettings,
    slot: Arc<Semaphore>,
    lock_path: Option<PathBuf>,
    outstanding: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ResourceManager {
    /// In-process slot only
    pub fn new(runtime: Arc<dyn ModelRuntime>, models: ModelsSettings) -> Self {
        Self {
            runtime,
            models,
            slot: Arc::new(Semaphore::new(1)),
            lock_path: None,
            outstanding: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Also serialize with other processes through an advisory lock file
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    pub fn runtime(&self) -> &Arc<dyn ModelRuntime> {
        &self.runtime
    }

    pub fn models(&self) -> &ModelsSettings {
        &self.models
    }

    /// Heavy leases currently held through this manager
    pub fn outstanding_leases(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Highest number of heavy leases ever held at once
    pub fn peak_leases(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Take the slot (heavy models only) and load the model for `kind`
    #[instrument(skip(self))]
    pub async fn acquire(
        &self,
        kind: ModelKind,
        mode: AcquireMode,
    ) -> Result<ModelLease, ResourceError> {
        let spec = self.models.spec(kind).clone();
        let started = Instant::now();

        let guard = if spec.is_heavy() {
            Some(self.take_slot(kind, mode).await?)
        } else {
            None
        };
        let waited = started.elapsed();

        let over_budget = self
            .models
            .resource_budget_bytes
            .is_some_and(|budget| spec.estimated_bytes > budget);
        let fallback = spec.fallback.clone().map(|id| {
            let bytes = spec.fallback_estimated_bytes.unwrap_or(spec.estimated_bytes);
            (id, bytes)
        });

        let (model, estimated_bytes, fallback, degraded) = match fallback {
            Some((id, bytes)) if over_budget => {
                info!(
                    primary = %spec.id,
                    fallback = %id,
                    estimated_bytes = spec.estimated_bytes,
                    "Primary model exceeds resource budget, starting on fallback"
                );
                (id, bytes, None, true)
            }
            other => (spec.id.clone(), spec.estimated_bytes, other, false),
        };

        let mut lease = ModelLease {
            kind,
            model,
            fallback,
            acquired_at: Utc::now(),
            estimated_bytes,
            degraded,
            waited,
            runtime: self.runtime.clone(),
            guard,
            released: false,
        };

        let loaded = match self.runtime.load(kind, &lease.model).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_out_of_memory() => lease.degrade(e).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = loaded {
            if let Err(unload) = lease.shutdown().await {
                debug!(error = %unload, "Unload after failed load");
            }
            return Err(e);
        }

        debug!(
            model = %lease.model,
            waited_ms = waited.as_millis() as u64,
            heavy = lease.is_heavy(),
            "Lease acquired"
        );
        Ok(lease)
    }

    /// Unload the model and free the slot
    pub async fn release(&self, mut lease: ModelLease) -> Result<(), ResourceError> {
        let held_ms = (Utc::now() - lease.acquired_at).num_milliseconds();
        let result = lease.shutdown().await;
        debug!(kind = %lease.kind, model = %lease.model, held_ms, "Lease released");
        result.map_err(ResourceError::from)
    }

    /// Run `f` with a lease that is released on every exit path
    pub async fn scoped<T, E, F>(&self, kind: ModelKind, mode: AcquireMode, f: F) -> Result<T, E>
    where
        E: From<ResourceError>,
        F: for<'a> FnOnce(&'a mut ModelLease) -> LeaseFuture<'a, T, E>,
    {
        let mut lease = self.acquire(kind, mode).await?;
        let result = f(&mut lease).await;
        if let Err(e) = self.release(lease).await {
            warn!(%kind, error = %e, "Lease release failed");
        }
        result
    }

    async fn take_slot(&self, kind: ModelKind, mode: AcquireMode) -> Result<SlotGuard, ResourceError> {
        let permit = match mode {
            AcquireMode::Wait => self
                .slot
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ResourceError::Closed)?,
            AcquireMode::FailFast => {
                self.slot
                    .clone()
                    .try_acquire_owned()
                    .map_err(|e| match e {
                        TryAcquireError::NoPermits => ResourceError::Busy { kind },
                        TryAcquireError::Closed => ResourceError::Closed,
                    })?
            }
        };

        let lock_file = match &self.lock_path {
            Some(path) => Some(lock_slot_file(path.clone(), kind, mode).await?),
            None => None,
        };

        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(SlotGuard {
            _permit: permit,
            lock_file,
            outstanding: self.outstanding.clone(),
        })
    }
}

/// Take the cross-process slot lock on a blocking thread
async fn lock_slot_file(
    path: PathBuf,
    kind: ModelKind,
    mode: AcquireMode,
) -> Result<std::fs::File, ResourceError> {
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ResourceError::Lock(format!("{}: {}", parent.display(), e)))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| ResourceError::Lock(format!("{}: {}", path.display(), e)))?;

        match mode {
            AcquireMode::Wait => file
                .lock_exclusive()
                .map_err(|e| ResourceError::Lock(e.to_string()))?,
            AcquireMode::FailFast => file
                .try_lock_exclusive()
                .map_err(|_| ResourceError::Busy { kind })?,
        }
        Ok(file)
    })
    .await
    .map_err(|e| ResourceError::Lock(format!("lock task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockRuntime;
    use crate::config::ModelSpec;

    fn models() -> ModelsSettings {
        ModelsSettings {
            transcription: ModelSpec::heavy("asr-large", 3000).with_fallback("asr-small", 1000),
            generation: ModelSpec::heavy("gen-large", 9000).with_fallback("gen-small", 4000),
            embedding: ModelSpec::light("embed", 500),
            ..ModelsSettings::default()
        }
    }

    fn manager(runtime: Arc<MockRuntime>) -> ResourceManager {
        ResourceManager::new(runtime, models())
    }

    #[tokio::test]
    async fn test_release_leaves_nothing_resident() {
        let runtime = Arc::new(MockRuntime::new().with_model_size("asr-large", 3000));
        let manager = manager(runtime.clone());

        for _ in 0..5 {
            let lease = manager
                .acquire(ModelKind::Transcription, AcquireMode::Wait)
                .await
                .unwrap();
            assert_eq!(runtime.resident_bytes(), 3000);
            assert_eq!(manager.outstanding_leases(), 1);
            manager.release(lease).await.unwrap();
            assert_eq!(runtime.resident_bytes(), 0);
            assert_eq!(manager.outstanding_leases(), 0);
        }
        assert_eq!(runtime.load_count(), 5);
        assert_eq!(runtime.unload_count(), 5);
    }

    #[tokio::test]
    async fn test_fail_fast_reports_busy() {
        let runtime = Arc::new(MockRuntime::new());
        let manager = manager(runtime);

        let held = manager
            .acquire(ModelKind::Generation, AcquireMode::Wait)
            .await
            .unwrap();
        let err = manager
            .acquire(ModelKind::Transcription, AcquireMode::FailFast)
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::Busy { .. }));

        manager.release(held).await.unwrap();
        let lease = manager
            .acquire(ModelKind::Transcription, AcquireMode::FailFast)
            .await
            .unwrap();
        manager.release(lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_light_models_bypass_slot() {
        let runtime = Arc::new(MockRuntime::new());
        let manager = manager(runtime.clone());

        let heavy = manager
            .acquire(ModelKind::Generation, AcquireMode::Wait)
            .await
            .unwrap();
        let light = manager
            .acquire(ModelKind::Embedding, AcquireMode::FailFast)
            .await
            .unwrap();
        assert!(!light.is_heavy());
        assert_eq!(manager.outstanding_leases(), 1);

        manager.release(light).await.unwrap();
        manager.release(heavy).await.unwrap();
        assert!(runtime.resident_models().is_empty());
    }

    #[tokio::test]
    async fn test_oom_on_load_uses_fallback() {
        let runtime = Arc::new(MockRuntime::new().with_oom_on_load("asr-large"));
        let manager = manager(runtime.clone());

        let lease = manager
            .acquire(ModelKind::Transcription, AcquireMode::Wait)
            .await
            .unwrap();
        assert_eq!(lease.model(), "asr-small");
        assert!(lease.is_degraded());
        assert_eq!(lease.estimated_bytes(), 1000);
        manager.release(lease).await.unwrap();
        assert!(runtime.resident_models().is_empty());
    }

    #[tokio::test]
    async fn test_oom_twice_is_exhausted() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_oom_on_load("asr-large")
                .with_oom_on_load("asr-small"),
        );
        let manager = manager(runtime.clone());

        let err = manager
            .acquire(ModelKind::Transcription, AcquireMode::Wait)
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::Exhausted { .. }));
        assert!(!err.is_retryable());
        assert_eq!(manager.outstanding_leases(), 0);
        assert!(runtime.resident_models().is_empty());
    }

    #[tokio::test]
    async fn test_oom_on_invoke_retries_once_with_fallback() {
        let runtime = Arc::new(MockRuntime::new());
        let manager = manager(runtime.clone());
        runtime.fail_next(
            ModelKind::Transcription,
            ModelError::OutOfMemory {
                model: "asr-large".into(),
                detail: "cuda".into(),
            },
            1,
        );

        let mut lease = manager
            .acquire(ModelKind::Transcription, AcquireMode::Wait)
            .await
            .unwrap();
        let text = lease
            .invoke(ModelRequest::Transcribe {
                path: "/nonexistent/a.m4a".into(),
                language: None,
            })
            .await
            .unwrap()
            .into_text()
            .unwrap();
        assert!(text.contains("a.m4a"));
        assert_eq!(lease.model(), "asr-small");
        manager.release(lease).await.unwrap();
        assert!(runtime.resident_models().is_empty());
        assert_eq!(runtime.max_concurrent_resident(), 1);
    }

    #[tokio::test]
    async fn test_budget_selects_fallback_up_front() {
        let runtime = Arc::new(MockRuntime::new());
        let mut settings = models();
        settings.resource_budget_bytes = Some(5000);
        let manager = ResourceManager::new(runtime.clone(), settings);

        let lease = manager
            .acquire(ModelKind::Generation, AcquireMode::Wait)
            .await
            .unwrap();
        assert_eq!(lease.model(), "gen-small");
        assert!(lease.is_degraded());
        manager.release(lease).await.unwrap();

        let lease = manager
            .acquire(ModelKind::Transcription, AcquireMode::Wait)
            .await
            .unwrap();
        assert_eq!(lease.model(), "asr-large");
        manager.release(lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_scoped_releases_on_error() {
        let runtime = Arc::new(MockRuntime::new());
        let manager = manager(runtime.clone());

        let result: Result<(), ResourceError> = manager
            .scoped(ModelKind::Generation, AcquireMode::Wait, |lease| {
                Box::pin(async move {
                    assert_eq!(lease.model(), "gen-large");
                    Err(ResourceError::Closed)
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(manager.outstanding_leases(), 0);
        assert!(runtime.resident_models().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_lease_is_unloaded() {
        let runtime = Arc::new(MockRuntime::new());
        let manager = manager(runtime.clone());

        let lease = manager
            .acquire(ModelKind::Generation, AcquireMode::Wait)
            .await
            .unwrap();
        drop(lease);

        // The slot frees only after the spawned unload has run
        let lease = manager
            .acquire(ModelKind::Transcription, AcquireMode::Wait)
            .await
            .unwrap();
        assert_eq!(runtime.resident_models(), vec!["asr-large".to_string()]);
        manager.release(lease).await.unwrap();
        assert_eq!(runtime.max_concurrent_resident(), 1);
    }

    #[tokio::test]
    async fn test_lock_file_serializes_managers() {
        let temp = tempfile::TempDir::new().unwrap();
        let lock = temp.path().join("heavy-slot.lock");
        let first = manager(Arc::new(MockRuntime::new())).with_lock_file(&lock);
        let second = manager(Arc::new(MockRuntime::new())).with_lock_file(&lock);

        let held = first
            .acquire(ModelKind::Generation, AcquireMode::Wait)
            .await
            .unwrap();
        let err = second
            .acquire(ModelKind::Generation, AcquireMode::FailFast)
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::Busy { .. }));

        first.release(held).await.unwrap();
        let lease = second
            .acquire(ModelKind::Generation, AcquireMode::FailFast)
            .await
            .unwrap();
        second.release(lease).await.unwrap();
    }
}
