//! SystemRecoveryManager：把错误恢复与阶段协调接到一起
//!
//! - 统计错误与恢复结果，维护按关联 id 索引的未恢复错误表
//! - 恢复前后钩子（失败只记录日志）
//! - 系统检查点：对一组阶段同时打检查点，整体回滚
//! - 后台健康巡检：未恢复错误过多或恢复率过低时告警

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::system::SystemErrorRecovery;
use super::types::{ErrorClassification, OperationError, RecoveryRecommendation, RecoveryStrategy};
use crate::core::{CleanupCallback, CoordinatorError, LoopHandle};
use crate::phase::PhaseCoordinator;
use crate::resources::{EventPriority, EventType, ResourceType, Resources};

pub const SYSTEM_CHECKPOINT_KEY_PREFIX: &str = "system_checkpoint:";

/// 恢复前后钩子
#[async_trait::async_trait]
pub trait RecoveryHook: Send + Sync {
    fn name(&self) -> &str {
        "recovery_hook"
    }

    async fn before_recovery(&self, error: &OperationError, component_id: &str) -> anyhow::Result<()>;

    async fn after_recovery(
        &self,
        error: &OperationError,
        component_id: &str,
        classification: Option<&ErrorClassification>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub health_check_interval: Duration,
    pub health_check_error_backoff: Duration,
    /// 未恢复错误超过该数量时告警
    pub max_active_errors: usize,
    pub min_recovery_rate: f64,
    /// 恢复率告警需要的最少错误数
    pub min_errors_for_rate_alert: u64,
    pub stop_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(300),
            health_check_error_backoff: Duration::from_secs(60),
            max_active_errors: 10,
            min_recovery_rate: 0.5,
            min_errors_for_rate_alert: 5,
            stop_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryCounters {
    pub total_errors: u64,
    pub recovered_errors: u64,
    pub failed_recoveries: u64,
    pub manual_interventions: u64,
    pub phase_rollbacks: u64,
    pub circuit_breaker_trips: u64,
}

/// 尚未恢复的错误
#[derive(Debug, Clone)]
pub struct ActiveError {
    pub correlation_id: String,
    pub component_id: String,
    pub operation: String,
    pub error: OperationError,
    pub attempts: u32,
    pub first_seen: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryMetrics {
    pub counters: RecoveryCounters,
    pub active_errors: usize,
    /// recovered / total；尚无错误时为 1.0
    pub recovery_rate: f64,
    pub timestamp: DateTime<Utc>,
}

/// 一组阶段检查点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCheckpoint {
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    /// phase_id -> 阶段检查点 id
    pub phase_checkpoints: BTreeMap<String, String>,
    pub counters: RecoveryCounters,
}

pub struct SystemRecoveryManager {
    resources: Resources,
    recovery: Arc<SystemErrorRecovery>,
    coordinator: Arc<PhaseCoordinator>,
    settings: ManagerSettings,
    counters: RwLock<RecoveryCounters>,
    active_errors: RwLock<HashMap<String, ActiveError>>,
    checkpoints: RwLock<HashMap<String, SystemCheckpoint>>,
    hooks: RwLock<Vec<Arc<dyn RecoveryHook>>>,
    health_loop: Mutex<Option<LoopHandle>>,
}

impl SystemRecoveryManager {
    pub fn new(
        resources: Resources,
        recovery: Arc<SystemErrorRecovery>,
        coordinator: Arc<PhaseCoordinator>,
    ) -> Self {
        Self {
            resources,
            recovery,
            coordinator,
            settings: ManagerSettings::default(),
            counters: RwLock::new(RecoveryCounters::default()),
            active_errors: RwLock::new(HashMap::new()),
            checkpoints: RwLock::new(HashMap::new()),
            hooks: RwLock::new(Vec::new()),
            health_loop: Mutex::new(None),
        }
    }

    pub fn with_settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn coordinator(&self) -> &Arc<PhaseCoordinator> {
        &self.coordinator
    }

    pub fn recovery(&self) -> &Arc<SystemErrorRecovery> {
        &self.recovery
    }

    pub async fn add_hook(&self, hook: Arc<dyn RecoveryHook>) {
        tracing::debug!("Registered recovery hook {}", hook.name());
        self.hooks.write().await.push(hook);
    }

    /// 启动协调器、恢复层与健康巡检
    pub async fn start(self: &Arc<Self>) -> Result<(), CoordinatorError> {
        self.coordinator.start().await?;
        self.recovery.start().await;

        let mut slot = self.health_loop.lock().await;
        if slot.as_ref().map_or(false, |h| h.is_running()) {
            return Ok(());
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(LoopHandle::spawn(
            "recovery_health_check",
            CancellationToken::new(),
            self.settings.health_check_interval,
            self.settings.health_check_error_backoff,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.run_health_check().await;
                    }
                    Ok(())
                }
            },
        ));
        tracing::info!("System recovery manager started");
        Ok(())
    }

    pub async fn stop(&self) {
        let handle = self.health_loop.lock().await.take();
        if let Some(handle) = handle {
            handle.stop(self.settings.stop_timeout).await;
        }
        self.recovery.stop().await;
        self.coordinator.stop().await;
        tracing::info!("System recovery manager stopped");
    }

    /// 停止全部后台任务并关闭协调器
    pub async fn shutdown(&self) {
        self.stop().await;
        self.coordinator.shutdown().await;
        let metrics = self.get_recovery_metrics().await;
        tracing::info!(
            "Recovery manager shut down: {} errors, {} recovered, {} still active",
            metrics.counters.total_errors,
            metrics.counters.recovered_errors,
            metrics.active_errors
        );
    }

    /// 交给 SystemErrorRecovery 处理并记录结果
    pub async fn handle_operation_error(
        &self,
        error: &mut OperationError,
        operation: &str,
        component_id: &str,
        cleanup: Option<&dyn CleanupCallback>,
    ) -> Result<ErrorClassification, OperationError> {
        let correlation_id = error.ensure_correlation_id();
        self.counters.write().await.total_errors += 1;

        let hooks = self.hooks.read().await.clone();
        for hook in &hooks {
            if let Err(e) = hook.before_recovery(error, component_id).await {
                tracing::warn!("Recovery hook {} before_recovery failed: {}", hook.name(), e);
            }
        }

        let outcome = self
            .recovery
            .handle_operation_error(error, operation, component_id, cleanup)
            .await;

        for hook in &hooks {
            if let Err(e) = hook
                .after_recovery(error, component_id, outcome.as_ref().ok())
                .await
            {
                tracing::warn!("Recovery hook {} after_recovery failed: {}", hook.name(), e);
            }
        }

        let recovered = matches!(&outcome, Ok(c) if c.recovery_succeeded == Some(true));
        let manual = matches!(
            &outcome,
            Ok(c) if c.recovery_strategy == Some(RecoveryStrategy::ManualInterventionRequired)
        );
        {
            let mut counters = self.counters.write().await;
            if recovered {
                counters.recovered_errors += 1;
            } else {
                counters.failed_recoveries += 1;
            }
            if manual {
                counters.manual_interventions += 1;
            }
        }

        let now = Utc::now();
        let mut active = self.active_errors.write().await;
        if recovered {
            active.remove(&correlation_id);
        } else {
            let entry = active
                .entry(correlation_id.clone())
                .or_insert_with(|| ActiveError {
                    correlation_id: correlation_id.clone(),
                    component_id: component_id.to_string(),
                    operation: operation.to_string(),
                    error: error.clone(),
                    attempts: 0,
                    first_seen: now,
                    last_attempt: now,
                });
            entry.error = error.clone();
            entry.attempts += 1;
            entry.last_attempt = now;
        }
        drop(active);

        self.resources
            .metrics
            .record(
                "recovery_manager:error_handled",
                if recovered { 1.0 } else { 0.0 },
                json!({"component_id": component_id, "operation": operation, "correlation_id": correlation_id}),
            )
            .await;
        outcome
    }

    /// 对未恢复的错误再执行一次其策略；未知关联 id 返回 false
    pub async fn retry_failed_recovery(&self, correlation_id: &str) -> bool {
        let Some(active) = self.active_errors.read().await.get(correlation_id).cloned() else {
            tracing::warn!("No active error with correlation id {}", correlation_id);
            return false;
        };

        let success = self
            .recovery
            .implement_recovery_strategy(&active.error, &active.component_id, None)
            .await;
        if success {
            self.active_errors.write().await.remove(correlation_id);
            self.counters.write().await.recovered_errors += 1;
            tracing::info!("Retried recovery succeeded for {}", correlation_id);
        } else if let Some(entry) = self.active_errors.write().await.get_mut(correlation_id) {
            entry.attempts += 1;
            entry.last_attempt = Utc::now();
            tracing::warn!(
                "Retried recovery failed for {} (attempt {})",
                correlation_id,
                entry.attempts
            );
        }
        success
    }

    pub async fn active_errors(&self) -> Vec<ActiveError> {
        let mut errors: Vec<_> = self.active_errors.read().await.values().cloned().collect();
        errors.sort_by_key(|e| e.first_seen);
        errors
    }

    /// 对给定阶段逐一打检查点，返回系统检查点 id
    pub async fn create_system_checkpoint(&self, phase_ids: &[&str]) -> Result<String, CoordinatorError> {
        let mut phase_checkpoints = BTreeMap::new();
        for phase_id in phase_ids {
            let id = self.coordinator.create_checkpoint(phase_id).await?;
            phase_checkpoints.insert(phase_id.to_string(), id);
        }

        let checkpoint = SystemCheckpoint {
            checkpoint_id: format!("system_checkpoint_{}", &Uuid::new_v4().simple().to_string()[..8]),
            created_at: Utc::now(),
            phase_checkpoints,
            counters: self.counters.read().await.clone(),
        };
        self.resources
            .state
            .set(
                &format!("{SYSTEM_CHECKPOINT_KEY_PREFIX}{}", checkpoint.checkpoint_id),
                serde_json::to_value(&checkpoint)?,
                ResourceType::Checkpoint,
                Some(json!({"phase_count": checkpoint.phase_checkpoints.len()})),
            )
            .await?;
        self.resources
            .emit(
                EventType::PhaseCoordination,
                json!({
                    "event_type": "system_checkpoint_created",
                    "checkpoint_id": checkpoint.checkpoint_id,
                    "phases": checkpoint.phase_checkpoints.keys().collect::<Vec<_>>(),
                    "timestamp": checkpoint.created_at.to_rfc3339(),
                }),
                EventPriority::Normal,
            )
            .await;

        tracing::info!(
            "Created system checkpoint {} covering {} phases",
            checkpoint.checkpoint_id,
            checkpoint.phase_checkpoints.len()
        );
        let id = checkpoint.checkpoint_id.clone();
        self.checkpoints.write().await.insert(id.clone(), checkpoint);
        Ok(id)
    }

    /// 把系统检查点中的每个阶段回滚，返回回滚的阶段数
    pub async fn rollback_to_checkpoint(&self, checkpoint_id: &str) -> Result<usize, CoordinatorError> {
        let checkpoint = self.load_system_checkpoint(checkpoint_id).await?;
        let mut rolled_back = 0;
        for (phase_id, phase_checkpoint) in &checkpoint.phase_checkpoints {
            self.coordinator.rollback_to_checkpoint(phase_checkpoint).await?;
            tracing::info!("Rolled back phase {} to {}", phase_id, phase_checkpoint);
            rolled_back += 1;
        }
        self.counters.write().await.phase_rollbacks += rolled_back as u64;
        Ok(rolled_back)
    }

    async fn load_system_checkpoint(&self, checkpoint_id: &str) -> Result<SystemCheckpoint, CoordinatorError> {
        if let Some(checkpoint) = self.checkpoints.read().await.get(checkpoint_id) {
            return Ok(checkpoint.clone());
        }
        let key = format!("{SYSTEM_CHECKPOINT_KEY_PREFIX}{checkpoint_id}");
        match self.resources.state.get(&key).await? {
            Some(entry) => Ok(serde_json::from_value(entry.state)?),
            None => Err(CoordinatorError::CheckpointNotFound(checkpoint_id.to_string())),
        }
    }

    /// 执行监控代理给出的建议；主动作失败时执行一次备用动作
    pub async fn apply_recovery_recommendation(
        &self,
        component_id: &str,
        recommendation: &RecoveryRecommendation,
        cleanup: Option<&dyn CleanupCallback>,
    ) -> bool {
        let error = OperationError::new(
            "RecommendedRecovery",
            recommendation.decision_context.primary_trigger.clone(),
        )
        .with_resource(component_id)
        .with_recovery_strategy(recommendation.recommended_action.clone());

        let mut executed = recommendation.recommended_action.clone();
        let mut success = self
            .recovery
            .implement_recovery_strategy(&error, component_id, cleanup)
            .await;
        if !success {
            if let Some(fallback) = recommendation
                .fallback_action
                .as_ref()
                .filter(|f| **f != recommendation.recommended_action)
            {
                tracing::warn!(
                    "Recommended action {} failed for {}, applying fallback {}",
                    recommendation.recommended_action,
                    component_id,
                    fallback
                );
                executed = fallback.clone();
                success = self
                    .recovery
                    .implement_recovery_strategy(
                        &error.clone().with_recovery_strategy(fallback.clone()),
                        component_id,
                        cleanup,
                    )
                    .await;
            }
        }
        if executed == RecoveryStrategy::ManualInterventionRequired {
            self.counters.write().await.manual_interventions += 1;
        }
        success
    }

    /// 打开熔断器并计数
    pub async fn trip_circuit_breaker(&self, circuit: &str) -> bool {
        let tripped = self.coordinator.trip_circuit_breaker(circuit).await;
        if tripped {
            self.counters.write().await.circuit_breaker_trips += 1;
            tracing::warn!("Circuit breaker {} tripped by recovery manager", circuit);
        }
        tripped
    }

    pub async fn get_recovery_metrics(&self) -> RecoveryMetrics {
        let counters = self.counters.read().await.clone();
        let recovery_rate = if counters.total_errors == 0 {
            1.0
        } else {
            counters.recovered_errors as f64 / counters.total_errors as f64
        };
        RecoveryMetrics {
            counters,
            active_errors: self.active_errors.read().await.len(),
            recovery_rate,
            timestamp: Utc::now(),
        }
    }

    /// 单次健康巡检，返回发出的告警类型
    pub async fn run_health_check(&self) -> Vec<String> {
        let metrics = self.get_recovery_metrics().await;
        let mut alerts = Vec::new();

        if metrics.active_errors > self.settings.max_active_errors {
            alerts.push("excessive_active_errors".to_string());
        }
        if metrics.counters.total_errors > self.settings.min_errors_for_rate_alert
            && metrics.recovery_rate < self.settings.min_recovery_rate
        {
            alerts.push("low_recovery_rate".to_string());
        }

        for alert_type in &alerts {
            tracing::warn!(
                "Recovery health alert {}: {} active errors, recovery rate {:.2}",
                alert_type,
                metrics.active_errors,
                metrics.recovery_rate
            );
            self.resources
                .emit(
                    EventType::ResourceAlertCreated,
                    json!({
                        "alert_type": alert_type,
                        "component": "system_recovery_manager",
                        "severity": "WARNING",
                        "active_errors": metrics.active_errors,
                        "recovery_rate": metrics.recovery_rate,
                        "timestamp": metrics.timestamp.to_rfc3339(),
                    }),
                    EventPriority::High,
                )
                .await;
        }
        self.resources
            .metrics
            .record(
                "recovery_manager:recovery_rate",
                metrics.recovery_rate,
                json!({"active_errors": metrics.active_errors}),
            )
            .await;
        alerts
    }
}
