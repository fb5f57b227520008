//! SystemErrorRecovery：操作错误的分类、恢复建议、策略执行与强制清理
//!
//! 处理顺序：
//! 1. 若注入了 `RecoveryAdvisor`，先在超时内交给它处理；失败或超时则回退到内置流程
//! 2. 内置流程：补全关联 id → 分类 → 更新组件健康 → 发布 resource_error_occurred
//! 3. 取得恢复建议，错误未自带策略时采用建议的策略并执行；失败时按建议执行一次备用策略
//! 4. FATAL、恢复失败或超过强制清理阈值时强制清理（最终策略为人工介入时除外）
//!
//! 处理过程中的内部失败一律记录日志并返回原始错误，不会替换触发错误。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use super::classifier::{ClassifierThresholds, CountingClassifier, ErrorClassifier};
use super::strategy::StrategyExecutor;
use super::types::{
    ErrorClassification, ErrorContext, ErrorSeverity, OperationError, RecoveryRecommendation,
    RecoveryStrategy,
};
use crate::core::CleanupCallback;
use crate::monitoring::SystemMonitoringAgent;
use crate::resources::{EventPriority, EventType, HealthStatus, Resources};

/// 可替换的高级恢复实现
#[async_trait::async_trait]
pub trait RecoveryAdvisor: Send + Sync {
    async fn handle_operation_error(
        &self,
        error: &OperationError,
        operation: &str,
        component_id: &str,
        cleanup: Option<&dyn CleanupCallback>,
    ) -> anyhow::Result<ErrorClassification>;

    async fn recommend(&self, context: &ErrorContext) -> anyhow::Result<RecoveryRecommendation>;
}

/// 恢复层参数
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    /// advisor 与监控代理调用的时限
    pub advisor_timeout: Duration,
    /// restart_component 中每一步的时限
    pub restart_step_timeout: Duration,
    pub classifier: ClassifierThresholds,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            advisor_timeout: Duration::from_secs(5),
            restart_step_timeout: Duration::from_secs(1),
            classifier: ClassifierThresholds::default(),
        }
    }
}

pub struct SystemErrorRecovery {
    resources: Resources,
    classifier: Arc<dyn ErrorClassifier>,
    strategies: StrategyExecutor,
    monitoring: Arc<SystemMonitoringAgent>,
    advisor: Option<Arc<dyn RecoveryAdvisor>>,
    settings: RecoverySettings,
    running: AtomicBool,
}

impl SystemErrorRecovery {
    pub fn new(resources: Resources, monitoring: Arc<SystemMonitoringAgent>) -> Self {
        let settings = RecoverySettings::default();
        Self {
            classifier: Arc::new(CountingClassifier::new().with_thresholds(settings.classifier)),
            strategies: StrategyExecutor::new(resources.clone())
                .with_step_timeout(settings.restart_step_timeout),
            resources,
            monitoring,
            advisor: None,
            settings,
            running: AtomicBool::new(false),
        }
    }

    /// 替换参数；默认分类器按新阈值重建
    pub fn with_settings(mut self, settings: RecoverySettings) -> Self {
        self.classifier = Arc::new(CountingClassifier::new().with_thresholds(settings.classifier));
        self.strategies = StrategyExecutor::new(self.resources.clone())
            .with_step_timeout(settings.restart_step_timeout);
        self.settings = settings;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn RecoveryAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn monitoring_agent(&self) -> &Arc<SystemMonitoringAgent> {
        &self.monitoring
    }

    pub fn settings(&self) -> &RecoverySettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 启动监控代理
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.monitoring.start().await;
        tracing::info!("System error recovery started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.monitoring.stop().await;
        tracing::info!("System error recovery stopped");
    }

    /// 处理操作错误并返回分类结果
    ///
    /// `error` 会被补全关联 id，并在未自带策略时写入建议策略；内部失败时返回 `Err(原始错误)`。
    pub async fn handle_operation_error(
        &self,
        error: &mut OperationError,
        operation: &str,
        component_id: &str,
        cleanup: Option<&dyn CleanupCallback>,
    ) -> Result<ErrorClassification, OperationError> {
        let original = error.clone();

        if let Some(advisor) = &self.advisor {
            let handled = tokio::time::timeout(
                self.settings.advisor_timeout,
                advisor.handle_operation_error(error, operation, component_id, cleanup),
            )
            .await;
            match handled {
                Ok(Ok(classification)) => {
                    self.update_error_health(component_id, operation, error, &classification, true)
                        .await;
                    return Ok(classification);
                }
                Ok(Err(e)) => tracing::error!(
                    "Recovery advisor failed for {}:{}, falling back to built-in recovery: {}",
                    component_id,
                    operation,
                    e
                ),
                Err(_) => tracing::error!(
                    "Recovery advisor timed out for {}:{}, falling back to built-in recovery",
                    component_id,
                    operation
                ),
            }
        }

        match self.handle_builtin(error, operation, component_id, cleanup).await {
            Ok(classification) => Ok(classification),
            Err(e) => {
                tracing::error!(
                    "Error handling failed for {}:{}: {}",
                    component_id,
                    operation,
                    e
                );
                Err(original)
            }
        }
    }

    async fn handle_builtin(
        &self,
        error: &mut OperationError,
        operation: &str,
        component_id: &str,
        cleanup: Option<&dyn CleanupCallback>,
    ) -> anyhow::Result<ErrorClassification> {
        let correlation_id = error.ensure_correlation_id();
        if error.operation.is_none() {
            error.operation = Some(operation.to_string());
        }

        let mut classification = self
            .classifier
            .classify(error, component_id, operation)
            .await?;
        self.update_error_health(component_id, operation, error, &classification, false)
            .await;
        error.severity.get_or_insert(classification.severity);

        self.resources
            .emit(
                EventType::ResourceErrorOccurred,
                json!({
                    "component_id": component_id,
                    "operation": error.operation,
                    "error_type": classification.error_type,
                    "severity": classification.severity,
                    "message": error.to_string(),
                    "correlation_id": correlation_id,
                    "impact_score": classification.impact_score,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
                EventPriority::High,
            )
            .await;

        let recommendation = self
            .get_recovery_recommendation(error, component_id, operation)
            .await;
        if error.recovery_strategy.is_none() {
            tracing::info!(
                "Recommended recovery strategy {} for {}:{}",
                recommendation.recommended_action,
                component_id,
                operation
            );
            error.recovery_strategy = Some(recommendation.recommended_action.clone());
        }
        error
            .details
            .insert("recommendation".into(), serde_json::to_value(&recommendation)?);

        let mut recovered = None;
        if error.recovery_strategy.is_some() {
            let mut success = self
                .implement_recovery_strategy(error, component_id, cleanup)
                .await;
            if !success {
                if let Some(fallback) = fallback_for(error, &recommendation) {
                    tracing::warn!(
                        "Recovery strategy {} failed for {}, trying fallback {}",
                        recommendation.recommended_action,
                        component_id,
                        fallback
                    );
                    error.recovery_strategy = Some(fallback);
                    success = self
                        .implement_recovery_strategy(error, component_id, cleanup)
                        .await;
                }
            }
            recovered = Some(success);
        }

        let manual = error.recovery_strategy == Some(RecoveryStrategy::ManualInterventionRequired);
        let needs_forced_cleanup = classification.severity == ErrorSeverity::Fatal
            || recovered != Some(true)
            || self
                .classifier
                .requires_forced_cleanup(component_id, operation)
                .await;
        if needs_forced_cleanup && !manual {
            if let Some(cb) = cleanup {
                tracing::warn!("Forcing cleanup '{}' for {}", cb.name(), component_id);
                cb.cleanup(true).await?;
            }
        }

        classification.recovery_strategy = error.recovery_strategy.clone();
        classification.recovery_succeeded = recovered;
        Ok(classification)
    }

    /// 取得恢复建议：先问 advisor，再问监控代理；都不可用时返回保守默认建议
    pub async fn get_recovery_recommendation(
        &self,
        error: &OperationError,
        component_id: &str,
        operation: &str,
    ) -> RecoveryRecommendation {
        let context = ErrorContext::from_error(error, component_id, operation);

        if let Some(advisor) = &self.advisor {
            match tokio::time::timeout(self.settings.advisor_timeout, advisor.recommend(&context))
                .await
            {
                Ok(Ok(recommendation)) => return recommendation,
                Ok(Err(e)) => tracing::error!(
                    "Recovery advisor recommendation failed, using monitoring agent: {}",
                    e
                ),
                Err(_) => tracing::error!(
                    "Recovery advisor recommendation timed out, using monitoring agent"
                ),
            }
        }

        match tokio::time::timeout(
            self.settings.advisor_timeout,
            self.monitoring.get_recovery_recommendation(&context),
        )
        .await
        {
            Ok(recommendation) => recommendation,
            Err(_) => {
                tracing::error!(
                    "Monitoring agent recommendation timed out for {}",
                    component_id
                );
                RecoveryRecommendation::conservative_default(component_id)
            }
        }
    }

    /// 按错误上的策略执行恢复
    pub async fn implement_recovery_strategy(
        &self,
        error: &OperationError,
        component_id: &str,
        cleanup: Option<&dyn CleanupCallback>,
    ) -> bool {
        self.strategies.execute(error, component_id, cleanup).await
    }

    async fn update_error_health(
        &self,
        component_id: &str,
        operation: &str,
        error: &OperationError,
        classification: &ErrorClassification,
        advanced: bool,
    ) {
        let status = if classification.severity == ErrorSeverity::Fatal {
            HealthStatus::Critical
        } else {
            HealthStatus::Degraded
        };
        self.resources
            .health
            .update_health(
                component_id,
                status,
                &format!("Error in operation {operation}: {error}"),
                json!({
                    "error_type": classification.error_type,
                    "severity": classification.severity,
                    "operation": operation,
                    "correlation_id": error.correlation_id,
                    "using_advanced_recovery": advanced,
                }),
            )
            .await;
    }
}

/// 仅当失败的正是建议动作、且建议给出了不同的备用动作时才执行备用策略
fn fallback_for(
    error: &OperationError,
    recommendation: &RecoveryRecommendation,
) -> Option<RecoveryStrategy> {
    let executed = error.recovery_strategy.as_ref()?;
    let fallback = recommendation.fallback_action.as_ref()?;
    (executed == &recommendation.recommended_action && fallback != executed)
        .then(|| fallback.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FnCleanup;
    use crate::monitoring::{MonitoringSettings, StaticCollector};
    use crate::resources::{HealthTracker, InMemoryResources};
    use std::sync::Mutex;

    fn recovery(res: &InMemoryResources) -> SystemErrorRecovery {
        let agent = Arc::new(
            SystemMonitoringAgent::new(res.handles(), Arc::new(StaticCollector::default()))
                .with_settings(MonitoringSettings::default()),
        );
        SystemErrorRecovery::new(res.handles(), agent)
    }

    fn recorder() -> (Arc<Mutex<Vec<bool>>>, impl Fn(bool) -> anyhow::Result<()> + Send + Sync) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        (calls, move |forced| {
            sink.lock().unwrap().push(forced);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_fatal_error_forces_cleanup_and_marks_critical() {
        let res = InMemoryResources::new();
        let rec = recovery(&res);
        let (calls, f) = recorder();
        let cb = FnCleanup::new("c1-cleanup", f);

        let mut err = OperationError::new("CorruptionError", "index corrupted")
            .with_severity(ErrorSeverity::Fatal);
        let classification = rec
            .handle_operation_error(&mut err, "rebuild", "c1", Some(&cb))
            .await
            .unwrap();

        assert_eq!(classification.severity, ErrorSeverity::Fatal);
        assert!(calls.lock().unwrap().contains(&true));
        assert_eq!(res.health.get_health("c1").await.unwrap().status, HealthStatus::Critical);
        assert!(err.correlation_id.is_some());
        assert_eq!(err.operation.as_deref(), Some("rebuild"));
        assert_eq!(
            res.events.events_of(EventType::ResourceErrorOccurred).await[0].payload["severity"],
            "FATAL"
        );
    }

    #[tokio::test]
    async fn test_manual_intervention_skips_forced_cleanup() {
        let res = InMemoryResources::new();
        let rec = recovery(&res);
        let (calls, f) = recorder();
        let cb = FnCleanup::new("c1-cleanup", f);

        let mut err = OperationError::new("SecurityError", "credentials leaked")
            .with_severity(ErrorSeverity::Fatal)
            .with_recovery_strategy(RecoveryStrategy::ManualInterventionRequired);
        let classification = rec
            .handle_operation_error(&mut err, "auth", "c1", Some(&cb))
            .await
            .unwrap();

        assert_eq!(classification.recovery_succeeded, Some(false));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_error_recovers_without_cleanup() {
        let res = InMemoryResources::new();
        let rec = recovery(&res);
        let (calls, f) = recorder();
        let cb = FnCleanup::new("db-cleanup", f);

        let mut err = OperationError::timeout("db", "query", 2.0);
        let classification = rec
            .handle_operation_error(&mut err, "query", "db", Some(&cb))
            .await
            .unwrap();

        assert_eq!(classification.severity, ErrorSeverity::Transient);
        assert_eq!(classification.recovery_strategy, Some(RecoveryStrategy::RetryWithBackoff));
        assert_eq!(classification.recovery_succeeded, Some(true));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(res.health.get_health("db").await.unwrap().status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_recommended_strategy_is_attached() {
        let res = InMemoryResources::new();
        let rec = recovery(&res);

        let mut err = OperationError::new("TimeoutError", "slow peer");
        rec.handle_operation_error(&mut err, "sync", "peer", None)
            .await
            .unwrap();
        assert!(err.recovery_strategy.is_some());
        assert!(err.details.contains_key("recommendation"));
    }

    struct FailingClassifier;

    #[async_trait::async_trait]
    impl ErrorClassifier for FailingClassifier {
        async fn classify(
            &self,
            _error: &OperationError,
            _component_id: &str,
            _operation: &str,
        ) -> anyhow::Result<ErrorClassification> {
            anyhow::bail!("classifier offline")
        }

        async fn requires_forced_cleanup(&self, _component_id: &str, _operation: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_internal_failure_returns_original_error() {
        let res = InMemoryResources::new();
        let rec = recovery(&res).with_classifier(Arc::new(FailingClassifier));

        let mut err = OperationError::new("IoError", "disk gone");
        let returned = rec
            .handle_operation_error(&mut err, "write", "store", None)
            .await
            .unwrap_err();
        assert_eq!(returned.message, "disk gone");
        assert!(returned.correlation_id.is_none());
    }

    struct SlowAdvisor;

    #[async_trait::async_trait]
    impl RecoveryAdvisor for SlowAdvisor {
        async fn handle_operation_error(
            &self,
            _error: &OperationError,
            _operation: &str,
            _component_id: &str,
            _cleanup: Option<&dyn CleanupCallback>,
        ) -> anyhow::Result<ErrorClassification> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            anyhow::bail!("unreachable")
        }

        async fn recommend(&self, _context: &ErrorContext) -> anyhow::Result<RecoveryRecommendation> {
            anyhow::bail!("no opinion")
        }
    }

    #[tokio::test]
    async fn test_advisor_timeout_falls_back() {
        let res = InMemoryResources::new();
        let rec = recovery(&res)
            .with_settings(RecoverySettings {
                advisor_timeout: Duration::from_millis(20),
                ..RecoverySettings::default()
            })
            .with_advisor(Arc::new(SlowAdvisor));

        let mut err = OperationError::new("IoError", "flaky");
        let classification = rec
            .handle_operation_error(&mut err, "read", "store", None)
            .await
            .unwrap();
        assert_eq!(classification.source, "store");
        assert!(classification.recovery_strategy.is_some());
    }
}
