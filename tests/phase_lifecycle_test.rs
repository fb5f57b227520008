//! 阶段生命周期集成测试：流水线、依赖、暂停 / 恢复、检查点与熔断

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fftt::core::PhaseFailure;
use fftt::phase::{
    CircuitBreakerConfig, JsonMap, NestedExecutionOptions, PhaseContext, PhaseCoordinator,
    PhaseExecutor, PhaseState, PhaseType, RunStatus, SimulatedExecutor,
};
use fftt::resources::{EventType, InMemoryResources};
use serde_json::json;

/// 总是失败的执行器，记录调用次数
struct FailingExecutor {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl PhaseExecutor for FailingExecutor {
    async fn execute(&self, _context: &PhaseContext, _input: JsonMap) -> Result<JsonMap, PhaseFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PhaseFailure::new("BuildError", "compilation failed"))
    }
}

fn coordinator(resources: &InMemoryResources) -> PhaseCoordinator {
    PhaseCoordinator::new(resources.handles())
        .with_executor(Arc::new(SimulatedExecutor::new().with_delay(Duration::ZERO)))
}

#[tokio::test]
async fn test_pipeline_with_nested_checkpoints() {
    let resources = InMemoryResources::new();
    let coordinator = coordinator(&resources);

    coordinator
        .initialize_phase("p1", PhaseType::One, JsonMap::new(), None, None)
        .await
        .unwrap();
    let result = coordinator.start_phase("p1", JsonMap::new()).await;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.phase_type.as_deref(), Some("phase_one"));
    let p1 = coordinator.phase_context("p1").await.unwrap();
    assert_eq!(p1.state, PhaseState::Completed);
    assert!(p1.end_time.is_some());

    coordinator
        .initialize_phase("p2", PhaseType::Two, JsonMap::new(), Some("p1"), None)
        .await
        .unwrap();
    let nested = coordinator
        .coordinate_nested_execution(
            "p1",
            "p2",
            JsonMap::new(),
            NestedExecutionOptions::new().with_checkpoints(true, true),
        )
        .await
        .unwrap();
    assert_eq!(nested.status, RunStatus::Success);
    let metadata = nested.execution_metadata.expect("nested metadata");
    assert!(metadata.checkpoints.before.is_some());
    assert!(metadata.checkpoints.after.is_some());

    let p2 = coordinator.phase_context("p2").await.unwrap();
    assert_eq!(p2.state, PhaseState::Completed);
    assert_eq!(p2.parent_phase_id.as_deref(), Some("p1"));

    let state_events = resources.events.events_of(EventType::PhaseStateChanged).await;
    assert!(!state_events.is_empty());
}

#[tokio::test]
async fn test_unfulfilled_dependency_leaves_state_untouched() {
    let resources = InMemoryResources::new();
    let coordinator = coordinator(&resources);

    coordinator
        .initialize_phase("design", PhaseType::One, JsonMap::new(), None, None)
        .await
        .unwrap();
    let mut config = JsonMap::new();
    config.insert("dependencies".into(), json!(["design"]));
    coordinator
        .initialize_phase("build", PhaseType::Two, config, None, None)
        .await
        .unwrap();

    for _ in 0..2 {
        let result = coordinator.start_phase("build", JsonMap::new()).await;
        assert_eq!(result.status, RunStatus::DependencyError);
        assert_eq!(result.unfulfilled_dependencies, vec!["design".to_string()]);
        let build = coordinator.phase_context("build").await.unwrap();
        assert_eq!(build.state, PhaseState::Ready);
        assert!(build.start_time.is_none());
    }

    coordinator.start_phase("design", JsonMap::new()).await;
    let result = coordinator.start_phase("build", JsonMap::new()).await;
    assert_eq!(result.status, RunStatus::Success);
}

#[tokio::test]
async fn test_pause_and_resume_only_from_documented_states() {
    let resources = InMemoryResources::new();
    let coordinator = Arc::new(
        PhaseCoordinator::new(resources.handles())
            .with_executor(Arc::new(SimulatedExecutor::new().with_delay(Duration::from_millis(300)))),
    );
    coordinator
        .initialize_phase("slow", PhaseType::Three, JsonMap::new(), None, None)
        .await
        .unwrap();

    assert!(!coordinator.pause_phase("slow", "not running yet").await);
    assert!(!coordinator.resume_phase("slow").await);
    assert_eq!(coordinator.phase_state("slow").await, Some(PhaseState::Ready));

    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.start_phase("slow", JsonMap::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(coordinator.pause_phase("slow", "operator hold").await);
    assert!(!coordinator.pause_phase("slow", "again").await);
    assert_eq!(coordinator.phase_state("slow").await, Some(PhaseState::Paused));
    assert!(coordinator.resume_phase("slow").await);
    assert!(!coordinator.resume_phase("slow").await);

    let result = runner.await.unwrap();
    assert_eq!(result.status, RunStatus::Success);
    let ctx = coordinator.phase_context("slow").await.unwrap();
    assert_eq!(ctx.state, PhaseState::Completed);
    assert!(ctx.end_time.is_some());
}

#[tokio::test]
async fn test_checkpoint_restore_reproduces_context() {
    let resources = InMemoryResources::new();
    let coordinator = coordinator(&resources);

    coordinator
        .initialize_phase("base", PhaseType::Zero, JsonMap::new(), None, None)
        .await
        .unwrap();
    let mut config = JsonMap::new();
    config.insert("dependencies".into(), json!(["base"]));
    config.insert("target".into(), json!("wasm"));
    coordinator
        .initialize_phase("compile", PhaseType::Two, config.clone(), None, None)
        .await
        .unwrap();

    let checkpoint_id = coordinator.create_checkpoint("compile").await.unwrap();
    coordinator.start_phase("base", JsonMap::new()).await;
    coordinator.start_phase("compile", JsonMap::new()).await;
    assert_eq!(coordinator.phase_state("compile").await, Some(PhaseState::Completed));

    coordinator.restore_from_checkpoint(&checkpoint_id).await.unwrap();
    let restored = coordinator.phase_context("compile").await.unwrap();
    assert_eq!(restored.state, PhaseState::Ready);
    assert_eq!(restored.config, config);
    assert!(restored.dependencies.contains("base"));
    assert!(restored.end_time.is_none());

    assert!(coordinator.restore_from_checkpoint("checkpoint_missing").await.is_err());
}

#[tokio::test]
async fn test_open_circuit_rejects_without_executing() {
    let resources = InMemoryResources::new();
    let executor = Arc::new(FailingExecutor {
        calls: AtomicUsize::new(0),
    });
    let mut overrides = HashMap::new();
    overrides.insert("phase_two".to_string(), CircuitBreakerConfig::new(2, 3600, 300));
    let coordinator = PhaseCoordinator::new(resources.handles())
        .with_executor(executor.clone())
        .with_circuit_configs(overrides);

    for id in ["b1", "b2", "b3"] {
        coordinator
            .initialize_phase(id, PhaseType::Two, JsonMap::new(), None, None)
            .await
            .unwrap();
    }

    for id in ["b1", "b2"] {
        let result = coordinator.start_phase(id, JsonMap::new()).await;
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error_type.as_deref(), Some("BuildError"));
        let ctx = coordinator.phase_context(id).await.unwrap();
        assert_eq!(ctx.state, PhaseState::Failed);
        assert!(ctx.end_time.is_some());
    }

    let rejected = coordinator.start_phase("b3", JsonMap::new()).await;
    assert_eq!(rejected.status, RunStatus::CircuitOpen);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    assert_eq!(coordinator.phase_state("b3").await, Some(PhaseState::Ready));

    coordinator
        .initialize_phase("other", PhaseType::One, JsonMap::new(), None, None)
        .await
        .unwrap();
    let other = coordinator.start_phase("other", JsonMap::new()).await;
    assert_eq!(other.status, RunStatus::Error);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_abort_sets_end_time_and_clears_active() {
    let resources = InMemoryResources::new();
    let coordinator = Arc::new(
        PhaseCoordinator::new(resources.handles())
            .with_executor(Arc::new(SimulatedExecutor::new().with_delay(Duration::from_millis(200)))),
    );
    coordinator
        .initialize_phase("doomed", PhaseType::Four, JsonMap::new(), None, None)
        .await
        .unwrap();

    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.start_phase("doomed", JsonMap::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(coordinator.abort_phase("doomed", "requirements changed").await);
    runner.await.unwrap();

    let ctx = coordinator.phase_context("doomed").await.unwrap();
    assert_eq!(ctx.state, PhaseState::Aborted);
    assert!(ctx.end_time.is_some());
    assert!(!coordinator.abort_phase("doomed", "twice").await);
    let info = coordinator.get_current_phase_info().await;
    assert!(info.active_phases.is_empty());
}
