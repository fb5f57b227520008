//! 系统监控
//!
//! - `metrics`：指标快照、24 小时滚动历史与采集器
//! - `rules`：DEV_BLOCKED / RESOURCE_CRITICAL / ERROR_SURGE / COMPONENT_FAILURE 决策树
//! - `agent`：周期分析循环与恢复建议

pub mod agent;
pub mod metrics;
pub mod rules;

pub use agent::{MonitoringReport, MonitoringSettings, SystemMonitoringAgent};
pub use metrics::{
    DevelopmentState, ErrorCounts, HealthTrackerCollector, MetricsCollector, MetricsHistory,
    ResourceUsage, StaticCollector, SystemMetrics,
};
pub use rules::{evaluate_all, FlagEvaluation, FlagType, RuleThresholds};
