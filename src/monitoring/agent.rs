//! SystemMonitoringAgent：周期采集指标、评估规则、发布 monitoring_alert，并给出恢复建议

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::metrics::{MetricsCollector, MetricsHistory, SystemMetrics};
use super::rules::{evaluate_all, FlagEvaluation, FlagType, RuleThresholds};
use crate::core::LoopHandle;
use crate::recovery::{
    DecisionContext, ErrorContext, ErrorSeverity, RecoveryRecommendation, RecoveryStrategy,
};
use crate::resources::{EventPriority, EventType, Resources};

#[derive(Debug, Clone)]
pub struct MonitoringSettings {
    pub interval: Duration,
    pub error_backoff: Duration,
    pub history_window: ChronoDuration,
    pub recent_reports: usize,
    pub stop_timeout: Duration,
    pub thresholds: RuleThresholds,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            error_backoff: Duration::from_secs(60),
            history_window: ChronoDuration::hours(24),
            recent_reports: 10,
            stop_timeout: Duration::from_secs(2),
            thresholds: RuleThresholds::default(),
        }
    }
}

/// 一次分析的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringReport {
    pub timestamp: DateTime<Utc>,
    pub evaluations: Vec<FlagEvaluation>,
}

impl MonitoringReport {
    pub fn raised(&self) -> impl Iterator<Item = &FlagEvaluation> {
        self.evaluations.iter().filter(|e| e.flag_raised)
    }

    pub fn flag_raised(&self) -> bool {
        self.raised().next().is_some()
    }
}

pub struct SystemMonitoringAgent {
    resources: Resources,
    collector: Arc<dyn MetricsCollector>,
    settings: MonitoringSettings,
    history: RwLock<MetricsHistory>,
    reports: RwLock<VecDeque<MonitoringReport>>,
    task: Mutex<Option<LoopHandle>>,
}

impl SystemMonitoringAgent {
    pub fn new(resources: Resources, collector: Arc<dyn MetricsCollector>) -> Self {
        let settings = MonitoringSettings::default();
        Self {
            resources,
            collector,
            history: RwLock::new(MetricsHistory::new(settings.history_window)),
            reports: RwLock::new(VecDeque::new()),
            task: Mutex::new(None),
            settings,
        }
    }

    pub fn with_settings(mut self, settings: MonitoringSettings) -> Self {
        self.history = RwLock::new(MetricsHistory::new(settings.history_window));
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &MonitoringSettings {
        &self.settings
    }

    /// 启动周期分析（已在运行时忽略）
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock().await;
        if slot.as_ref().map_or(false, |h| h.is_running()) {
            return;
        }
        let weak = Arc::downgrade(self);
        *slot = Some(LoopHandle::spawn(
            "system_monitoring",
            CancellationToken::new(),
            self.settings.interval,
            self.settings.error_backoff,
            move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(agent) => agent.run_cycle().await.map(|_| ()),
                        None => Ok(()),
                    }
                }
            },
        ));
        tracing::info!("System monitoring agent started");
    }

    pub async fn stop(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if !handle.stop(self.settings.stop_timeout).await {
                tracing::warn!("Monitoring loop cancellation timed out");
            }
            tracing::info!("System monitoring agent stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map_or(false, |h| h.is_running())
    }

    /// 采集一次并分析
    pub async fn run_cycle(&self) -> anyhow::Result<MonitoringReport> {
        let metrics = self.collector.collect().await?;
        Ok(self.ingest(metrics).await)
    }

    /// 写入一份快照并按其时间戳评估规则；升旗的每棵树发布一条 monitoring_alert
    pub async fn ingest(&self, metrics: SystemMetrics) -> MonitoringReport {
        let now = metrics.timestamp;
        let evaluations = {
            let mut history = self.history.write().await;
            history.push(metrics);
            evaluate_all(&history, now, &self.settings.thresholds)
        };
        let report = MonitoringReport {
            timestamp: now,
            evaluations,
        };

        let raised: Vec<&FlagEvaluation> = report.raised().collect();
        if raised.is_empty() {
            tracing::info!("System monitoring analysis completed - no flags raised");
        }
        for evaluation in &raised {
            tracing::warn!(
                "Monitoring flag raised: {} for components {:?}",
                evaluation.flag_type,
                evaluation.affected_components
            );
            self.resources
                .emit(
                    EventType::MonitoringAlert,
                    json!({
                        "alert_type": evaluation.flag_type,
                        "affected_components": evaluation.affected_components,
                        "description": format!("System monitoring alert: {}", evaluation.flag_type),
                        "metrics": evaluation.metrics_snapshot,
                        "primary_triggers": evaluation.primary_triggers,
                        "contributing_factors": evaluation.contributing_factors,
                        "timestamp": now.to_rfc3339(),
                    }),
                    EventPriority::Normal,
                )
                .await;
        }
        self.resources
            .metrics
            .record(
                "monitoring:flags_raised",
                raised.len() as f64,
                json!({"flags": raised.iter().map(|e| e.flag_type.as_str()).collect::<Vec<_>>()}),
            )
            .await;

        let mut reports = self.reports.write().await;
        reports.push_back(report.clone());
        while reports.len() > self.settings.recent_reports {
            reports.pop_front();
        }
        report
    }

    /// 最近 `limit` 份报告（按时间顺序）
    pub async fn recent_reports(&self, limit: usize) -> Vec<MonitoringReport> {
        let reports = self.reports.read().await;
        let skip = reports.len().saturating_sub(limit);
        reports.iter().skip(skip).cloned().collect()
    }

    /// 结合错误严重度与最近一次升旗给出恢复建议
    pub async fn get_recovery_recommendation(&self, context: &ErrorContext) -> RecoveryRecommendation {
        let latest = self.reports.read().await.back().cloned();
        let raised: Vec<FlagEvaluation> = latest
            .map(|r| r.evaluations.into_iter().filter(|e| e.flag_raised).collect())
            .unwrap_or_default();
        let flag = |flag_type: FlagType| raised.iter().find(|e| e.flag_type == flag_type);

        let component = context.component_id.as_str();
        let affects_component = flag(FlagType::ComponentFailure)
            .map_or(false, |e| e.affected_components.iter().any(|c| c == component));

        let (action, fallback, trigger) = if context.severity == Some(ErrorSeverity::Fatal) {
            (
                RecoveryStrategy::EmergencyCleanup,
                RecoveryStrategy::ManualInterventionRequired,
                format!("FATAL error in component {component}"),
            )
        } else if affects_component {
            (
                RecoveryStrategy::RestartComponent,
                RecoveryStrategy::EnableFallbackSystems,
                format!("Component failure flagged for {component}"),
            )
        } else if flag(FlagType::ResourceCritical).is_some() {
            (
                RecoveryStrategy::TerminateResourceHeavyProcesses,
                RecoveryStrategy::ScaleUpResources,
                "Critical resource pressure".to_string(),
            )
        } else if flag(FlagType::ErrorSurge).is_some() {
            (
                RecoveryStrategy::ReduceLoad,
                RecoveryStrategy::RedistributeLoad,
                "System-wide error surge".to_string(),
            )
        } else if flag(FlagType::DevBlocked).is_some() {
            (
                RecoveryStrategy::ClearDevelopmentBlockers,
                RecoveryStrategy::ResetStalledPaths,
                "Development progress blocked".to_string(),
            )
        } else if context.severity == Some(ErrorSeverity::Degraded) {
            (
                RecoveryStrategy::ReduceLoad,
                RecoveryStrategy::ForceCleanup,
                format!("DEGRADED error in component {component}"),
            )
        } else {
            (
                RecoveryStrategy::RetryWithBackoff,
                RecoveryStrategy::ReduceLoad,
                format!(
                    "{} error in component {component}",
                    context.severity.map_or("Transient", |s| s.as_str())
                ),
            )
        };

        let mut contributing_factors: Vec<String> = raised
            .iter()
            .flat_map(|e| e.primary_triggers.iter().cloned())
            .collect();
        if contributing_factors.is_empty() {
            contributing_factors.push(format!("{}: {}", context.error_type, context.error_message));
        }
        let risk_assessment = if raised.is_empty() {
            "Low risk - isolated error"
        } else {
            "Medium risk of cascading failures if not addressed"
        };

        tracing::info!(
            "Recovery recommendation: {} (fallback {}) for {}",
            action,
            fallback,
            component
        );
        RecoveryRecommendation {
            recommended_action: action,
            required_components: vec![component.to_string()],
            fallback_action: Some(fallback),
            decision_context: DecisionContext {
                primary_trigger: trigger,
                contributing_factors,
                risk_assessment: risk_assessment.to_string(),
                success_likelihood: 0.75,
            },
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::metrics::StaticCollector;
    use crate::recovery::OperationError;
    use crate::resources::{HealthStatus, InMemoryResources};

    fn agent(res: &InMemoryResources) -> SystemMonitoringAgent {
        SystemMonitoringAgent::new(res.handles(), Arc::new(StaticCollector::default()))
    }

    fn context(severity: Option<ErrorSeverity>, component: &str) -> ErrorContext {
        let mut err = OperationError::new("TestError", "boom");
        err.severity = severity;
        ErrorContext::from_error(&err, component, "op")
    }

    #[tokio::test]
    async fn test_raised_flag_emits_alert() {
        let res = InMemoryResources::new();
        let agent = agent(&res);

        let report = agent
            .ingest(SystemMetrics::new(Utc::now()).with_health("db", HealthStatus::Critical))
            .await;
        assert!(report.flag_raised());

        let alerts = res.events.events_of(EventType::MonitoringAlert).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].payload["alert_type"], "COMPONENT_FAILURE");
        assert_eq!(alerts[0].payload["affected_components"][0], "db");
        assert!(alerts[0].payload["contributing_factors"].is_array());
        assert_eq!(res.metrics.latest("monitoring:flags_raised").await, Some(1.0));
    }

    #[tokio::test]
    async fn test_recent_reports_are_bounded() {
        let res = InMemoryResources::new();
        let agent = agent(&res).with_settings(MonitoringSettings {
            recent_reports: 3,
            ..MonitoringSettings::default()
        });
        let start = Utc::now();
        for i in 0..5 {
            agent
                .ingest(SystemMetrics::new(start + ChronoDuration::minutes(i)))
                .await;
        }
        let reports = agent.recent_reports(10).await;
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[2].timestamp, start + ChronoDuration::minutes(4));
        assert_eq!(agent.recent_reports(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_recommendation_follows_severity_and_flags() {
        let res = InMemoryResources::new();
        let agent = agent(&res);

        let fatal = agent
            .get_recovery_recommendation(&context(Some(ErrorSeverity::Fatal), "c1"))
            .await;
        assert_eq!(fatal.recommended_action, RecoveryStrategy::EmergencyCleanup);
        assert_eq!(fatal.fallback_action, Some(RecoveryStrategy::ManualInterventionRequired));
        assert_eq!(fatal.decision_context.success_likelihood, 0.75);

        let quiet = agent.get_recovery_recommendation(&context(None, "c1")).await;
        assert_eq!(quiet.recommended_action, RecoveryStrategy::RetryWithBackoff);

        agent
            .ingest(SystemMetrics::new(Utc::now()).with_health("c1", HealthStatus::Unhealthy))
            .await;
        let failing = agent.get_recovery_recommendation(&context(None, "c1")).await;
        assert_eq!(failing.recommended_action, RecoveryStrategy::RestartComponent);
        assert_eq!(failing.required_components, vec!["c1"]);
        assert!(failing.decision_context.contributing_factors[0].contains("c1 transitioned"));
    }

    #[tokio::test]
    async fn test_loop_runs_and_stops() {
        let res = InMemoryResources::new();
        let agent = Arc::new(agent(&res).with_settings(MonitoringSettings {
            interval: Duration::from_millis(10),
            ..MonitoringSettings::default()
        }));

        agent.start().await;
        assert!(agent.is_running().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.stop().await;
        assert!(!agent.is_running().await);
        assert!(!agent.recent_reports(10).await.is_empty());
    }
}
