//! 恢复策略执行
//!
//! 策略集合是封闭的：新增策略就是在 `execute` 中新增一个分支。
//! 围绕主动作的遥测事件尽力发布；以事件本身为主动作的策略（扩容、启用备用系统等）发布失败即视为恢复失败。

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use super::types::{OperationError, RecoveryStrategy};
use crate::core::{CleanupCallback, ResourceError};
use crate::resources::{EventPriority, EventType, HealthStatus, Resources};

/// 策略执行器
#[derive(Clone)]
pub struct StrategyExecutor {
    resources: Resources,
    step_timeout: Duration,
}

impl StrategyExecutor {
    pub fn new(resources: Resources) -> Self {
        Self {
            resources,
            step_timeout: Duration::from_secs(1),
        }
    }

    /// restart_component 中清理与健康更新各自的时限
    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    /// 按 `error.recovery_strategy` 执行恢复，返回是否恢复成功；内部错误只记录日志并返回 false
    pub async fn execute(
        &self,
        error: &OperationError,
        component_id: &str,
        cleanup: Option<&dyn CleanupCallback>,
    ) -> bool {
        let Some(strategy) = error.recovery_strategy.clone() else {
            tracing::warn!("No recovery strategy specified for error: {}", error);
            return false;
        };

        tracing::info!(
            "Implementing recovery strategy '{}' for {}: {}",
            strategy,
            component_id,
            error
        );
        match self.dispatch(&strategy, error, component_id, cleanup).await {
            Ok(recovered) => recovered,
            Err(e) => {
                tracing::error!(
                    "Recovery strategy '{}' failed for {}: {}",
                    strategy,
                    component_id,
                    e
                );
                false
            }
        }
    }

    async fn dispatch(
        &self,
        strategy: &RecoveryStrategy,
        error: &OperationError,
        component_id: &str,
        cleanup: Option<&dyn CleanupCallback>,
    ) -> anyhow::Result<bool> {
        match strategy {
            RecoveryStrategy::ForceCleanup => {
                let info = self.recovery_info(strategy, error, component_id);
                self.emit_started(strategy, error, component_id, &info).await;
                run_cleanup(cleanup, true).await?;
                self.set_health(
                    component_id,
                    HealthStatus::Degraded,
                    &format!("Force cleanup performed due to {}", error.error_type),
                    strategy,
                    error,
                )
                .await;
                self.emit_completed(strategy, error, component_id, &info).await;
                self.emit_resolved(strategy, error, component_id, &info).await;
                Ok(true)
            }
            RecoveryStrategy::ReduceLoad => {
                run_cleanup(cleanup, false).await?;
                self.set_health(
                    component_id,
                    HealthStatus::Degraded,
                    &format!("Load reduction performed due to {}", error.error_type),
                    strategy,
                    error,
                )
                .await;
                Ok(true)
            }
            RecoveryStrategy::RetryWithBackoff => {
                tracing::info!("Retry with backoff acknowledged for {}", component_id);
                Ok(true)
            }
            RecoveryStrategy::RestartComponent => {
                let info = self.recovery_info(strategy, error, component_id);
                self.emit_started(strategy, error, component_id, &info).await;

                if let Some(cb) = cleanup {
                    match tokio::time::timeout(self.step_timeout, cb.cleanup(true)).await {
                        Ok(result) => result?,
                        Err(_) => tracing::error!(
                            "Cleanup timeout during restart_component recovery for {}",
                            component_id
                        ),
                    }
                }
                let restart_message = format!("Component restarted due to {}", error.error_type);
                let health_update = self.set_health(
                    component_id,
                    HealthStatus::Degraded,
                    &restart_message,
                    strategy,
                    error,
                );
                if tokio::time::timeout(self.step_timeout, health_update)
                    .await
                    .is_err()
                {
                    tracing::error!(
                        "Health update timeout during restart_component recovery for {}",
                        component_id
                    );
                }

                self.emit_completed(strategy, error, component_id, &info).await;
                Ok(true)
            }
            RecoveryStrategy::EmergencyCleanup => {
                let info = self.recovery_info(strategy, error, component_id);
                self.emit_started(strategy, error, component_id, &info).await;
                run_cleanup(cleanup, true).await?;
                self.set_health(
                    component_id,
                    HealthStatus::Critical,
                    &format!("Emergency cleanup performed due to {}", error.error_type),
                    strategy,
                    error,
                )
                .await;
                self.resources
                    .emit(
                        EventType::ResourceAlertCreated,
                        json!({
                            "alert_type": "emergency_cleanup_performed",
                            "component": component_id,
                            "severity": "CRITICAL",
                            "error": error.to_string(),
                            "timestamp": Utc::now().to_rfc3339(),
                        }),
                        EventPriority::High,
                    )
                    .await;
                self.emit_completed(strategy, error, component_id, &info).await;
                self.emit_resolved(strategy, error, component_id, &info).await;
                Ok(true)
            }
            RecoveryStrategy::ManualInterventionRequired => {
                tracing::error!("Manual intervention required for {}: {}", component_id, error);
                let alert = json!({
                    "alert_type": "manual_intervention_required",
                    "component": component_id,
                    "severity": "CRITICAL",
                    "error": error.to_string(),
                    "details": error.details,
                    "timestamp": Utc::now().to_rfc3339(),
                });
                self.resources
                    .emit(EventType::ResourceAlertCreated, alert.clone(), EventPriority::High)
                    .await;

                let mut occurred = alert;
                if let Value::Object(map) = &mut occurred {
                    map.insert("requires_intervention".into(), json!(true));
                    map.insert("component_id".into(), json!(component_id));
                    map.insert(
                        "operation".into(),
                        json!(error.operation.as_deref().unwrap_or("unknown")),
                    );
                }
                self.resources
                    .emit(EventType::ResourceErrorOccurred, occurred, EventPriority::High)
                    .await;
                Ok(false)
            }
            RecoveryStrategy::ScaleUpResources => {
                self.emit_required(
                    EventType::ResourceScalingRequested,
                    json!({
                        "component_id": component_id,
                        "action": "scale_up",
                        "reason": error.to_string(),
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                )
                .await
            }
            RecoveryStrategy::RedistributeLoad => {
                run_cleanup(cleanup, false).await?;
                Ok(true)
            }
            RecoveryStrategy::TerminateResourceHeavyProcesses
            | RecoveryStrategy::ResetStalledPaths => {
                run_cleanup(cleanup, true).await?;
                Ok(true)
            }
            RecoveryStrategy::EnableFallbackSystems => {
                self.emit_required(
                    EventType::FallbackSystemActivated,
                    json!({
                        "component_id": component_id,
                        "reason": error.to_string(),
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                )
                .await
            }
            RecoveryStrategy::ClearDevelopmentBlockers => {
                self.emit_required(
                    EventType::DevelopmentBlockersCleared,
                    json!({
                        "component_id": component_id,
                        "reason": error.to_string(),
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                )
                .await
            }
            RecoveryStrategy::RollbackFailedChanges => {
                self.emit_required(
                    EventType::ChangesRollbackRequested,
                    json!({
                        "component_id": component_id,
                        "reason": error.to_string(),
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                )
                .await
            }
            RecoveryStrategy::Unknown(name) => {
                tracing::warn!("Unknown recovery strategy: {}", name);
                Ok(false)
            }
        }
    }

    /// 主动作即事件：发布失败视为恢复失败
    async fn emit_required(&self, event_type: EventType, payload: Value) -> anyhow::Result<bool> {
        let emitted: Result<(), ResourceError> = self
            .resources
            .events
            .emit(event_type, payload, EventPriority::Normal)
            .await;
        match emitted {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::error!("Failed to emit {}: {}", event_type, e);
                Ok(false)
            }
        }
    }

    fn recovery_info(
        &self,
        strategy: &RecoveryStrategy,
        error: &OperationError,
        component_id: &str,
    ) -> Value {
        json!({
            "strategy": strategy.as_str(),
            "component_id": component_id,
            "error_type": error.error_type,
            "severity": error.severity.map(|s| s.as_str()).unwrap_or("UNKNOWN"),
            "correlation_id": error.correlation_id,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    async fn emit_started(
        &self,
        strategy: &RecoveryStrategy,
        error: &OperationError,
        component_id: &str,
        info: &Value,
    ) {
        self.resources
            .emit(
                EventType::ResourceErrorRecoveryStarted,
                json!({
                    "error_id": error_id(error, component_id, strategy),
                    "component_id": component_id,
                    "recovery_strategy": strategy.as_str(),
                    "details": error.details,
                    "recovery_info": info,
                }),
                EventPriority::High,
            )
            .await;
    }

    async fn emit_completed(
        &self,
        strategy: &RecoveryStrategy,
        error: &OperationError,
        component_id: &str,
        info: &Value,
    ) {
        self.resources
            .emit(
                EventType::ResourceErrorRecoveryCompleted,
                json!({
                    "error_id": error_id(error, component_id, strategy),
                    "status": "completed",
                    "component_id": component_id,
                    "recovery_strategy": strategy.as_str(),
                    "recovery_info": info,
                }),
                EventPriority::High,
            )
            .await;
    }

    async fn emit_resolved(
        &self,
        strategy: &RecoveryStrategy,
        error: &OperationError,
        component_id: &str,
        info: &Value,
    ) {
        self.resources
            .emit(
                EventType::ResourceErrorResolved,
                json!({
                    "error_id": error_id(error, component_id, strategy),
                    "status": "recovered",
                    "component_id": component_id,
                    "recovery_strategy": strategy.as_str(),
                    "recovery_info": info,
                }),
                EventPriority::High,
            )
            .await;
    }

    async fn set_health(
        &self,
        component_id: &str,
        status: HealthStatus,
        description: &str,
        strategy: &RecoveryStrategy,
        error: &OperationError,
    ) {
        self.resources
            .health
            .update_health(
                component_id,
                status,
                description,
                json!({"recovery_strategy": strategy.as_str(), "error": error.to_string()}),
            )
            .await;
    }
}

fn error_id(error: &OperationError, component_id: &str, strategy: &RecoveryStrategy) -> String {
    format!(
        "{}:{}",
        component_id,
        error.operation.as_deref().unwrap_or(strategy.as_str())
    )
}

async fn run_cleanup(cleanup: Option<&dyn CleanupCallback>, forced: bool) -> anyhow::Result<()> {
    match cleanup {
        Some(cb) => {
            tracing::debug!("Running cleanup '{}' (forced: {})", cb.name(), forced);
            cb.cleanup(forced).await
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FnCleanup;
    use crate::resources::{HealthTracker, InMemoryResources};
    use std::sync::{Arc, Mutex};

    fn recording_cleanup() -> (FnCleanup<impl Fn(bool) -> anyhow::Result<()> + Send + Sync>, Arc<Mutex<Vec<bool>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let cb = FnCleanup::new("recording", move |forced| {
            sink.lock().unwrap().push(forced);
            Ok(())
        });
        (cb, calls)
    }

    fn error_with(strategy: RecoveryStrategy) -> OperationError {
        OperationError::new("TestError", "boom").with_recovery_strategy(strategy)
    }

    #[tokio::test]
    async fn test_force_cleanup_emits_lifecycle() {
        let res = InMemoryResources::new();
        let exec = StrategyExecutor::new(res.handles());
        let (cb, calls) = recording_cleanup();

        assert!(exec.execute(&error_with(RecoveryStrategy::ForceCleanup), "c1", Some(&cb)).await);
        assert_eq!(*calls.lock().unwrap(), vec![true]);
        assert_eq!(res.health.get_health("c1").await.unwrap().status, HealthStatus::Degraded);

        let types: Vec<_> = res.events.history().await.into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::ResourceErrorRecoveryStarted,
                EventType::ResourceErrorRecoveryCompleted,
                EventType::ResourceErrorResolved,
            ]
        );
    }

    #[tokio::test]
    async fn test_manual_intervention_always_fails() {
        let res = InMemoryResources::new();
        let exec = StrategyExecutor::new(res.handles());
        let (cb, calls) = recording_cleanup();

        let err = error_with(RecoveryStrategy::ManualInterventionRequired);
        assert!(!exec.execute(&err, "c1", Some(&cb)).await);
        assert!(calls.lock().unwrap().is_empty());

        let occurred = res.events.events_of(EventType::ResourceErrorOccurred).await;
        assert_eq!(occurred.len(), 1);
        assert_eq!(occurred[0].payload["requires_intervention"], true);
        assert_eq!(occurred[0].priority, EventPriority::High);
    }

    #[tokio::test]
    async fn test_unknown_strategy_skips_cleanup() {
        let res = InMemoryResources::new();
        let exec = StrategyExecutor::new(res.handles());
        let (cb, calls) = recording_cleanup();

        let err = error_with(RecoveryStrategy::parse("reticulate_splines"));
        assert!(!exec.execute(&err, "c1", Some(&cb)).await);
        assert!(!exec.execute(&OperationError::new("E", "no strategy"), "c1", Some(&cb)).await);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_failure_fails_strategy() {
        let res = InMemoryResources::new();
        let exec = StrategyExecutor::new(res.handles());
        let cb = FnCleanup::new("broken", |_| Err(anyhow::anyhow!("cleanup exploded")));

        assert!(!exec.execute(&error_with(RecoveryStrategy::ReduceLoad), "c1", Some(&cb)).await);
        assert!(!exec.execute(&error_with(RecoveryStrategy::RestartComponent), "c1", Some(&cb)).await);
    }

    struct SlowCleanup;

    #[async_trait::async_trait]
    impl CleanupCallback for SlowCleanup {
        async fn cleanup(&self, _forced: bool) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_restart_component_tolerates_timeout() {
        let res = InMemoryResources::new();
        let exec = StrategyExecutor::new(res.handles()).with_step_timeout(Duration::from_millis(10));

        assert!(exec.execute(&error_with(RecoveryStrategy::RestartComponent), "c1", Some(&SlowCleanup)).await);
        assert_eq!(
            res.events.events_of(EventType::ResourceErrorRecoveryCompleted).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_monitoring_strategies() {
        let res = InMemoryResources::new();
        let exec = StrategyExecutor::new(res.handles());
        let (cb, calls) = recording_cleanup();

        for strategy in [
            RecoveryStrategy::ScaleUpResources,
            RecoveryStrategy::RedistributeLoad,
            RecoveryStrategy::TerminateResourceHeavyProcesses,
            RecoveryStrategy::EnableFallbackSystems,
            RecoveryStrategy::ClearDevelopmentBlockers,
            RecoveryStrategy::ResetStalledPaths,
            RecoveryStrategy::RollbackFailedChanges,
            RecoveryStrategy::RetryWithBackoff,
        ] {
            assert!(exec.execute(&error_with(strategy.clone()), "c1", Some(&cb)).await, "{strategy}");
        }
        assert_eq!(*calls.lock().unwrap(), vec![false, true, true]);
        assert_eq!(res.events.events_of(EventType::ResourceScalingRequested).await.len(), 1);
        assert_eq!(res.events.events_of(EventType::FallbackSystemActivated).await.len(), 1);
        assert_eq!(res.events.events_of(EventType::DevelopmentBlockersCleared).await.len(), 1);
        assert_eq!(res.events.events_of(EventType::ChangesRollbackRequested).await.len(), 1);
    }

    #[tokio::test]
    async fn test_emergency_cleanup_marks_critical() {
        let res = InMemoryResources::new();
        let exec = StrategyExecutor::new(res.handles());

        assert!(exec.execute(&error_with(RecoveryStrategy::EmergencyCleanup), "c1", None).await);
        assert_eq!(res.health.get_health("c1").await.unwrap().status, HealthStatus::Critical);
        let alerts = res.events.events_of(EventType::ResourceAlertCreated).await;
        assert_eq!(alerts[0].payload["alert_type"], "emergency_cleanup_performed");
    }
}
