//! 错误模型：严重度、恢复策略、待处理错误、分类结果与恢复建议

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub type JsonMap = Map<String, Value>;

/// 错误严重度（按严重程度递增排序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    /// 暂时性，重试即可
    Transient,
    /// 部分功能受损
    Degraded,
    /// 不可自动恢复
    Fatal,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Transient => "TRANSIENT",
            ErrorSeverity::Degraded => "DEGRADED",
            ErrorSeverity::Fatal => "FATAL",
        }
    }

    pub fn default_impact(&self) -> f64 {
        match self {
            ErrorSeverity::Transient => 0.2,
            ErrorSeverity::Degraded => 0.5,
            ErrorSeverity::Fatal => 0.9,
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 恢复策略：固定枚举，未知名称保留原文以便记录
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RecoveryStrategy {
    ForceCleanup,
    ReduceLoad,
    RetryWithBackoff,
    RestartComponent,
    EmergencyCleanup,
    ManualInterventionRequired,
    ScaleUpResources,
    RedistributeLoad,
    TerminateResourceHeavyProcesses,
    EnableFallbackSystems,
    ClearDevelopmentBlockers,
    ResetStalledPaths,
    RollbackFailedChanges,
    Unknown(String),
}

impl RecoveryStrategy {
    pub const KNOWN: [RecoveryStrategy; 13] = [
        RecoveryStrategy::ForceCleanup,
        RecoveryStrategy::ReduceLoad,
        RecoveryStrategy::RetryWithBackoff,
        RecoveryStrategy::RestartComponent,
        RecoveryStrategy::EmergencyCleanup,
        RecoveryStrategy::ManualInterventionRequired,
        RecoveryStrategy::ScaleUpResources,
        RecoveryStrategy::RedistributeLoad,
        RecoveryStrategy::TerminateResourceHeavyProcesses,
        RecoveryStrategy::EnableFallbackSystems,
        RecoveryStrategy::ClearDevelopmentBlockers,
        RecoveryStrategy::ResetStalledPaths,
        RecoveryStrategy::RollbackFailedChanges,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            RecoveryStrategy::ForceCleanup => "force_cleanup",
            RecoveryStrategy::ReduceLoad => "reduce_load",
            RecoveryStrategy::RetryWithBackoff => "retry_with_backoff",
            RecoveryStrategy::RestartComponent => "restart_component",
            RecoveryStrategy::EmergencyCleanup => "emergency_cleanup",
            RecoveryStrategy::ManualInterventionRequired => "manual_intervention_required",
            RecoveryStrategy::ScaleUpResources => "scale_up_resources",
            RecoveryStrategy::RedistributeLoad => "redistribute_load",
            RecoveryStrategy::TerminateResourceHeavyProcesses => {
                "terminate_resource_heavy_processes"
            }
            RecoveryStrategy::EnableFallbackSystems => "enable_fallback_systems",
            RecoveryStrategy::ClearDevelopmentBlockers => "clear_development_blockers",
            RecoveryStrategy::ResetStalledPaths => "reset_stalled_paths",
            RecoveryStrategy::RollbackFailedChanges => "rollback_failed_changes",
            RecoveryStrategy::Unknown(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        Self::KNOWN
            .iter()
            .find(|s| s.as_str() == name)
            .cloned()
            .unwrap_or_else(|| RecoveryStrategy::Unknown(name.to_string()))
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, RecoveryStrategy::Unknown(_))
    }
}

impl From<String> for RecoveryStrategy {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&str> for RecoveryStrategy {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<RecoveryStrategy> for String {
    fn from(value: RecoveryStrategy) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 交给恢复层处理的操作错误；recovery_strategy 可被推荐结果改写
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{error_type}: {message}")]
pub struct OperationError {
    pub error_type: String,
    pub message: String,
    pub operation: Option<String>,
    pub resource_id: Option<String>,
    pub severity: Option<ErrorSeverity>,
    pub recovery_strategy: Option<RecoveryStrategy>,
    pub impact_score: Option<f64>,
    pub correlation_id: Option<String>,
    pub details: JsonMap,
}

impl OperationError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            operation: None,
            resource_id: None,
            severity: None,
            recovery_strategy: None,
            impact_score: None,
            correlation_id: None,
            details: JsonMap::new(),
        }
    }

    /// 资源耗尽：超过上限 1.5 倍视为致命并强制清理，否则降级并减载
    pub fn resource_exhaustion(resource_id: impl Into<String>, usage: f64, limit: f64) -> Self {
        let resource_id = resource_id.into();
        let (severity, strategy) = if usage > limit * 1.5 {
            (ErrorSeverity::Fatal, RecoveryStrategy::ForceCleanup)
        } else {
            (ErrorSeverity::Degraded, RecoveryStrategy::ReduceLoad)
        };
        let mut error = Self::new(
            "ResourceExhaustionError",
            format!("Resource {resource_id} exhausted: usage {usage:.1} exceeds limit {limit:.1}"),
        )
        .with_severity(severity)
        .with_recovery_strategy(strategy);
        error.details.insert("usage".into(), json!(usage));
        error.details.insert("limit".into(), json!(limit));
        error.resource_id = Some(resource_id);
        error
    }

    /// 操作超时：暂时性错误，建议退避重试
    pub fn timeout(resource_id: impl Into<String>, operation: impl Into<String>, timeout_secs: f64) -> Self {
        let resource_id = resource_id.into();
        let operation = operation.into();
        let mut error = Self::new(
            "ResourceTimeoutError",
            format!("Operation {operation} on {resource_id} timed out after {timeout_secs}s"),
        )
        .with_severity(ErrorSeverity::Transient)
        .with_recovery_strategy(RecoveryStrategy::RetryWithBackoff)
        .with_impact(0.3)
        .with_operation(operation);
        error
            .details
            .insert("timeout_seconds".into(), json!(timeout_secs));
        error.resource_id = Some(resource_id);
        error
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_recovery_strategy(mut self, strategy: impl Into<RecoveryStrategy>) -> Self {
        self.recovery_strategy = Some(strategy.into());
        self
    }

    pub fn with_impact(mut self, impact: f64) -> Self {
        self.impact_score = Some(impact.clamp(0.0, 1.0));
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_details(mut self, details: JsonMap) -> Self {
        self.details = details;
        self
    }

    /// 确保带有关联 id（缺失时生成），返回该 id
    pub fn ensure_correlation_id(&mut self) -> String {
        self.correlation_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone()
    }
}

/// 错误分类结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub severity: ErrorSeverity,
    pub error_type: String,
    pub source: String,
    /// 0..=1 的运行影响评分
    pub impact_score: f64,
    pub requires_intervention: bool,
    pub recovery_strategy: Option<RecoveryStrategy>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub context: JsonMap,
    /// 最终执行的策略是否成功；未执行策略时为 None
    pub recovery_succeeded: Option<bool>,
}

/// 推荐的决策依据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    pub primary_trigger: String,
    pub contributing_factors: Vec<String>,
    pub risk_assessment: String,
    pub success_likelihood: f64,
}

/// 恢复建议
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecommendation {
    pub recommended_action: RecoveryStrategy,
    pub required_components: Vec<String>,
    pub fallback_action: Option<RecoveryStrategy>,
    pub decision_context: DecisionContext,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryRecommendation {
    /// 分析失败时的保守默认建议
    pub fn conservative_default(component_id: &str) -> Self {
        Self {
            recommended_action: RecoveryStrategy::Unknown("reset_error_components".to_string()),
            required_components: vec![component_id.to_string()],
            fallback_action: Some(RecoveryStrategy::ManualInterventionRequired),
            decision_context: DecisionContext {
                primary_trigger: format!("Error in component {component_id}"),
                contributing_factors: vec![
                    "Default recovery recommendation due to analysis failure".to_string(),
                ],
                risk_assessment: "Unknown risk - proceed with caution".to_string(),
                success_likelihood: 0.5,
            },
            timestamp: Utc::now(),
        }
    }
}

/// 请求恢复建议时提供的错误上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub error_type: String,
    pub error_message: String,
    pub component_id: String,
    pub operation: String,
    pub severity: Option<ErrorSeverity>,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    pub fn from_error(error: &OperationError, component_id: &str, operation: &str) -> Self {
        Self {
            error_type: error.error_type.clone(),
            error_message: error.message.clone(),
            component_id: component_id.to_string(),
            operation: error.operation.clone().unwrap_or_else(|| operation.to_string()),
            severity: error.severity,
            correlation_id: error.correlation_id.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names_round_trip() {
        for s in RecoveryStrategy::KNOWN {
            assert_eq!(RecoveryStrategy::parse(s.as_str()), s);
        }
        let unknown = RecoveryStrategy::parse("reset_error_components");
        assert!(!unknown.is_known());
        assert_eq!(unknown.as_str(), "reset_error_components");
        assert_eq!(
            serde_json::to_value(RecoveryStrategy::ScaleUpResources).unwrap(),
            json!("scale_up_resources")
        );
    }

    #[test]
    fn test_resource_exhaustion_thresholds() {
        let fatal = OperationError::resource_exhaustion("memory", 1600.0, 1000.0);
        assert_eq!(fatal.severity, Some(ErrorSeverity::Fatal));
        assert_eq!(fatal.recovery_strategy, Some(RecoveryStrategy::ForceCleanup));

        let degraded = OperationError::resource_exhaustion("memory", 1200.0, 1000.0);
        assert_eq!(degraded.severity, Some(ErrorSeverity::Degraded));
        assert_eq!(degraded.recovery_strategy, Some(RecoveryStrategy::ReduceLoad));
    }

    #[test]
    fn test_timeout_error_and_correlation() {
        let mut err = OperationError::timeout("db", "query", 5.0);
        assert_eq!(err.severity, Some(ErrorSeverity::Transient));
        assert_eq!(err.impact_score, Some(0.3));
        assert_eq!(err.operation.as_deref(), Some("query"));

        let id = err.ensure_correlation_id();
        assert_eq!(err.ensure_correlation_id(), id);
        assert_eq!(err.to_string(), "ResourceTimeoutError: Operation query on db timed out after 5s");
    }

    #[test]
    fn test_conservative_default() {
        let rec = RecoveryRecommendation::conservative_default("store");
        assert_eq!(rec.recommended_action.as_str(), "reset_error_components");
        assert_eq!(rec.fallback_action, Some(RecoveryStrategy::ManualInterventionRequired));
        assert_eq!(rec.decision_context.success_likelihood, 0.5);
    }
}
