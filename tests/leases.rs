//! Heavy-model lease integration tests.
//!
//! Two simulated callers (the scheduler and an interactive front-end)
//! compete for the single heavy slot.

use std::sync::Arc;
use std::time::Duration;

use mulch::adapters::{MockRuntime, ModelKind, ModelRequest};
use mulch::config::{ModelSpec, ModelsSettings};
use mulch::resources::{AcquireMode, ResourceError, ResourceManager};
use tempfile::TempDir;

fn models() -> ModelsSettings {
    ModelsSettings {
        transcription: ModelSpec::heavy("large-v3", 3_000).with_fallback("medium", 1_500),
        generation: ModelSpec::heavy("qwen2.5:14b", 9_000).with_fallback("qwen2.5:7b", 4_700),
        ..ModelsSettings::default()
    }
}

fn runtime() -> Arc<MockRuntime> {
    Arc::new(
        MockRuntime::new()
            .with_model_size("large-v3", 3_000)
            .with_model_size("qwen2.5:14b", 9_000)
            .with_invoke_delay(ModelKind::Transcription, Duration::from_millis(20))
            .with_invoke_delay(ModelKind::Generation, Duration::from_millis(20)),
    )
}

#[tokio::test]
async fn test_overlapping_callers_never_hold_two_heavy_leases() {
    let runtime = runtime();
    let manager = ResourceManager::new(runtime.clone(), models());

    let mut handles = Vec::new();
    for (caller, kind) in [
        (0, ModelKind::Transcription),
        (1, ModelKind::Generation),
        (2, ModelKind::Transcription),
        (3, ModelKind::Generation),
    ] {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            for round in 0..3 {
                let mut lease = manager.acquire(kind, AcquireMode::Wait).await.unwrap();
                assert_eq!(manager.outstanding_leases(), 1);
                let request = match kind {
                    ModelKind::Transcription => ModelRequest::Transcribe {
                        path: format!("/nonexistent/{}-{}.m4a", caller, round).into(),
                        language: None,
                    },
                    _ => ModelRequest::Generate {
                        system: String::new(),
                        prompt: format!("caller {} round {}", caller, round),
                        json: true,
                    },
                };
                lease.invoke(request).await.unwrap();
                manager.release(lease).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(manager.peak_leases(), 1);
    assert_eq!(runtime.max_concurrent_resident(), 1);
    assert!(runtime.peak_resident_bytes() <= 9_000);
    assert_eq!(runtime.resident_bytes(), 0);
    assert_eq!(manager.outstanding_leases(), 0);
}

#[tokio::test]
async fn test_two_managers_share_the_slot_through_the_lock_file() {
    let temp = TempDir::new().unwrap();
    let lock = temp.path().join("heavy-slot.lock");
    let runtime = runtime();

    let scheduler = ResourceManager::new(runtime.clone(), models()).with_lock_file(&lock);
    let front_end = ResourceManager::new(runtime.clone(), models()).with_lock_file(&lock);

    let held = scheduler
        .acquire(ModelKind::Generation, AcquireMode::Wait)
        .await
        .unwrap();
    let err = front_end
        .acquire(ModelKind::Transcription, AcquireMode::FailFast)
        .await
        .unwrap_err();
    assert!(matches!(err, ResourceError::Busy { .. }));

    scheduler.release(held).await.unwrap();
    let lease = front_end
        .acquire(ModelKind::Transcription, AcquireMode::FailFast)
        .await
        .unwrap();
    front_end.release(lease).await.unwrap();
    assert_eq!(runtime.resident_bytes(), 0);
}

#[tokio::test]
async fn test_scoped_lease_is_released_when_the_body_fails() {
    let runtime = runtime();
    let manager = ResourceManager::new(runtime.clone(), models());

    let result: Result<(), ResourceError> = manager
        .scoped(ModelKind::Generation, AcquireMode::Wait, |_lease| {
            Box::pin(async move { Err(ResourceError::Closed) })
        })
        .await;
    assert!(result.is_err());
    assert_eq!(manager.outstanding_leases(), 0);
    assert_eq!(runtime.resident_bytes(), 0);
    assert_eq!(runtime.unload_count(), 1);
}

#[tokio::test]
async fn test_out_of_memory_degrades_to_fallback_model() {
    let runtime = Arc::new(MockRuntime::new().with_oom_on_load("large-v3"));
    let manager = ResourceManager::new(runtime.clone(), models());

    let lease = manager
        .acquire(ModelKind::Transcription, AcquireMode::Wait)
        .await
        .unwrap();
    assert_eq!(lease.model(), "medium");
    assert!(lease.is_degraded());
    manager.release(lease).await.unwrap();
    assert!(runtime.resident_models().is_empty());
}
