//! 恢复链路集成测试：分类 → 建议 → 策略执行 → 强制清理，以及恢复管理器的检查点回滚

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use fftt::core::FnCleanup;
use fftt::monitoring::{StaticCollector, SystemMetrics, SystemMonitoringAgent};
use fftt::phase::{JsonMap, PhaseCoordinator, PhaseState, PhaseType, SimulatedExecutor};
use fftt::recovery::{
    ErrorSeverity, OperationError, RecoveryStrategy, SystemErrorRecovery, SystemRecoveryManager,
};
use fftt::resources::{EventType, HealthStatus, HealthTracker, InMemoryResources};

fn build(resources: &InMemoryResources) -> (Arc<SystemMonitoringAgent>, Arc<SystemRecoveryManager>) {
    let handles = resources.handles();
    let monitoring = Arc::new(SystemMonitoringAgent::new(
        handles.clone(),
        Arc::new(StaticCollector::default()),
    ));
    let recovery = Arc::new(SystemErrorRecovery::new(handles.clone(), monitoring.clone()));
    let coordinator = Arc::new(
        PhaseCoordinator::new(handles.clone())
            .with_executor(Arc::new(SimulatedExecutor::new().with_delay(Duration::ZERO))),
    );
    let manager = Arc::new(SystemRecoveryManager::new(handles, recovery, coordinator));
    (monitoring, manager)
}

/// 记录每次清理调用的 forced 参数
fn recording_cleanup() -> (Arc<Mutex<Vec<bool>>>, impl fftt::core::CleanupCallback) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let cleanup = FnCleanup::new("recording", move |forced| {
        sink.lock().unwrap().push(forced);
        Ok(())
    });
    (calls, cleanup)
}

#[tokio::test]
async fn test_fatal_error_forces_cleanup_and_marks_critical() {
    let resources = InMemoryResources::new();
    let (_, manager) = build(&resources);
    let (calls, cleanup) = recording_cleanup();

    let mut error = OperationError::new("StorageFailure", "volume detached")
        .with_severity(ErrorSeverity::Fatal);
    let classification = manager
        .handle_operation_error(&mut error, "persist", "c1", Some(&cleanup))
        .await
        .unwrap();

    assert_eq!(classification.severity, ErrorSeverity::Fatal);
    assert!(calls.lock().unwrap().contains(&true));
    let health = resources.health.get_health("c1").await.unwrap();
    assert_eq!(health.status, HealthStatus::Critical);
    assert!(error.correlation_id.is_some());

    let occurred = resources.events.events_of(EventType::ResourceErrorOccurred).await;
    assert_eq!(occurred.len(), 1);
}

#[tokio::test]
async fn test_manual_and_unknown_strategies_never_succeed() {
    let resources = InMemoryResources::new();
    let (_, manager) = build(&resources);
    let (calls, cleanup) = recording_cleanup();
    let recovery = manager.recovery();

    let manual = OperationError::new("SecurityError", "signature mismatch")
        .with_recovery_strategy(RecoveryStrategy::ManualInterventionRequired);
    assert!(!recovery.implement_recovery_strategy(&manual, "auth", Some(&cleanup)).await);

    let unknown = OperationError::new("Weird", "unexpected")
        .with_recovery_strategy(RecoveryStrategy::from("reticulate_splines"));
    assert!(!recovery.implement_recovery_strategy(&unknown, "auth", Some(&cleanup)).await);

    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_resource_exhaustion_recovers_through_manager() {
    let resources = InMemoryResources::new();
    let (_, manager) = build(&resources);
    let (calls, cleanup) = recording_cleanup();

    let mut error = OperationError::resource_exhaustion("memory_pool", 180.0, 100.0);
    assert_eq!(error.severity, Some(ErrorSeverity::Fatal));
    let classification = manager
        .handle_operation_error(&mut error, "allocate", "memory_pool", Some(&cleanup))
        .await
        .unwrap();

    assert_eq!(classification.recovery_strategy, Some(RecoveryStrategy::ForceCleanup));
    assert_eq!(classification.recovery_succeeded, Some(true));
    assert!(!calls.lock().unwrap().is_empty());

    let metrics = manager.get_recovery_metrics().await;
    assert_eq!(metrics.counters.total_errors, 1);
    assert_eq!(metrics.counters.recovered_errors, 1);
    assert_eq!(metrics.active_errors, 0);
}

#[tokio::test]
async fn test_critical_resource_flag_shapes_recommendation() {
    let resources = InMemoryResources::new();
    let (monitoring, manager) = build(&resources);

    let start = Utc::now() - ChronoDuration::minutes(3);
    for i in 0..3 {
        monitoring
            .ingest(SystemMetrics::new(start + ChronoDuration::minutes(i)).with_usage("memory", 97.0, true))
            .await;
    }
    let alerts = resources.events.events_of(EventType::MonitoringAlert).await;
    assert!(!alerts.is_empty());

    let error = OperationError::new("SlowResponse", "worker lagging");
    let recommendation = manager
        .recovery()
        .get_recovery_recommendation(&error, "worker", "process_batch")
        .await;
    assert_eq!(
        recommendation.recommended_action,
        RecoveryStrategy::TerminateResourceHeavyProcesses
    );
    assert_eq!(recommendation.fallback_action, Some(RecoveryStrategy::ScaleUpResources));
    assert!(!recommendation.decision_context.contributing_factors.is_empty());
}

#[tokio::test]
async fn test_system_checkpoint_rolls_back_phases() {
    let resources = InMemoryResources::new();
    let (_, manager) = build(&resources);
    let coordinator = manager.coordinator();

    coordinator
        .initialize_phase("plan", PhaseType::One, JsonMap::new(), None, None)
        .await
        .unwrap();
    coordinator
        .initialize_phase("impl", PhaseType::Three, JsonMap::new(), Some("plan"), None)
        .await
        .unwrap();

    let checkpoint = manager.create_system_checkpoint(&["plan", "impl"]).await.unwrap();
    coordinator.start_phase("plan", JsonMap::new()).await;
    assert_eq!(coordinator.phase_state("plan").await, Some(PhaseState::Completed));

    let rolled_back = manager.rollback_to_checkpoint(&checkpoint).await.unwrap();
    assert_eq!(rolled_back, 2);
    assert_eq!(coordinator.phase_state("plan").await, Some(PhaseState::Ready));
    assert_eq!(manager.get_recovery_metrics().await.counters.phase_rollbacks, 2);

    assert!(manager.rollback_to_checkpoint("system_checkpoint_missing").await.is_err());
}

#[tokio::test]
async fn test_manager_lifecycle_starts_and_stops_loops() {
    let resources = InMemoryResources::new();
    let (monitoring, manager) = build(&resources);

    manager.start().await.unwrap();
    assert!(manager.recovery().is_running());
    assert!(monitoring.is_running().await);
    assert!(manager.coordinator().is_monitoring().await);

    manager.shutdown().await;
    assert!(!manager.recovery().is_running());
    assert!(!monitoring.is_running().await);
    assert!(!manager.coordinator().is_monitoring().await);
}
