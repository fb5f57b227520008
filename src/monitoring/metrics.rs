//! 指标快照、滚动历史与采集接口

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::resources::{HealthStatus, HealthTracker};

/// 单个资源来源的占用
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// 占容量的百分比（0..=100）
    pub usage_percent: f64,
    /// 是否关键资源
    #[serde(default)]
    pub critical: bool,
}

/// 一个采集周期内的错误/请求计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub errors: u64,
    pub requests: u64,
    /// 是否关键组件
    #[serde(default)]
    pub critical: bool,
}

impl ErrorCounts {
    pub fn rate(&self) -> Option<f64> {
        (self.requests > 0).then(|| self.errors as f64 / self.requests as f64)
    }
}

/// 开发进度状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevelopmentState {
    /// branch -> 状态（ACTIVE / HOLDING / COMPLETED ...）
    pub branches: BTreeMap<String, String>,
    /// 本周期产出的开发指标聚合数
    pub metric_aggregates: u64,
    /// 本周期完成的关键路径迁移数
    pub completed_critical_transitions: u64,
}

impl DevelopmentState {
    pub fn all_branches_holding(&self) -> bool {
        !self.branches.is_empty() && self.branches.values().all(|s| s == "HOLDING")
    }
}

/// 一次采集得到的系统指标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub component_health: BTreeMap<String, HealthStatus>,
    #[serde(default)]
    pub resource_usage: BTreeMap<String, ResourceUsage>,
    #[serde(default)]
    pub error_counts: BTreeMap<String, ErrorCounts>,
    #[serde(default)]
    pub development: Option<DevelopmentState>,
    /// 本周期内各组件的 resource_failed 事件数
    #[serde(default)]
    pub resource_failed: BTreeMap<String, u32>,
    /// subsystem -> 成员组件
    #[serde(default)]
    pub subsystems: BTreeMap<String, Vec<String>>,
    /// 主组件 -> 备份组件
    #[serde(default)]
    pub backups: BTreeMap<String, String>,
}

impl SystemMetrics {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            component_health: BTreeMap::new(),
            resource_usage: BTreeMap::new(),
            error_counts: BTreeMap::new(),
            development: None,
            resource_failed: BTreeMap::new(),
            subsystems: BTreeMap::new(),
            backups: BTreeMap::new(),
        }
    }

    pub fn with_health(mut self, component: impl Into<String>, status: HealthStatus) -> Self {
        self.component_health.insert(component.into(), status);
        self
    }

    pub fn with_usage(mut self, source: impl Into<String>, usage_percent: f64, critical: bool) -> Self {
        self.resource_usage.insert(
            source.into(),
            ResourceUsage {
                usage_percent,
                critical,
            },
        );
        self
    }

    pub fn with_errors(mut self, component: impl Into<String>, errors: u64, requests: u64, critical: bool) -> Self {
        self.error_counts.insert(
            component.into(),
            ErrorCounts {
                errors,
                requests,
                critical,
            },
        );
        self
    }

    pub fn with_development(mut self, development: DevelopmentState) -> Self {
        self.development = Some(development);
        self
    }

    pub fn with_resource_failed(mut self, component: impl Into<String>, count: u32) -> Self {
        self.resource_failed.insert(component.into(), count);
        self
    }

    pub fn with_subsystem(mut self, name: impl Into<String>, members: &[&str]) -> Self {
        self.subsystems
            .insert(name.into(), members.iter().map(|m| m.to_string()).collect());
        self
    }

    pub fn with_backup(mut self, primary: impl Into<String>, backup: impl Into<String>) -> Self {
        self.backups.insert(primary.into(), backup.into());
        self
    }

    /// 本次上报了任何指标的组件
    pub fn reporting_components(&self) -> BTreeSet<&str> {
        self.component_health
            .keys()
            .chain(self.resource_usage.keys())
            .chain(self.error_counts.keys())
            .map(String::as_str)
            .collect()
    }
}

/// 按时间排序的指标快照，只保留窗口内的数据
#[derive(Debug, Clone)]
pub struct MetricsHistory {
    window: ChronoDuration,
    snapshots: VecDeque<SystemMetrics>,
}

impl MetricsHistory {
    pub fn new(window: ChronoDuration) -> Self {
        Self {
            window,
            snapshots: VecDeque::new(),
        }
    }

    /// 追加快照并裁剪超出窗口的旧数据；乱序的快照被丢弃
    pub fn push(&mut self, metrics: SystemMetrics) -> bool {
        if let Some(last) = self.snapshots.back() {
            if metrics.timestamp < last.timestamp {
                tracing::warn!(
                    "Dropping out-of-order metrics snapshot at {}",
                    metrics.timestamp
                );
                return false;
            }
        }
        let cutoff = metrics.timestamp - self.window;
        self.snapshots.push_back(metrics);
        while self
            .snapshots
            .front()
            .map_or(false, |s| s.timestamp <= cutoff)
        {
            self.snapshots.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest(&self) -> Option<&SystemMetrics> {
        self.snapshots.back()
    }

    /// 倒数第二个快照
    pub fn previous(&self) -> Option<&SystemMetrics> {
        self.snapshots.len().checked_sub(2).and_then(|i| self.snapshots.get(i))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &SystemMetrics> {
        self.snapshots.iter()
    }

    /// 最近 n 个快照（按时间顺序）
    pub fn last_n(&self, n: usize) -> Vec<&SystemMetrics> {
        let skip = self.snapshots.len().saturating_sub(n);
        self.snapshots.iter().skip(skip).collect()
    }

    /// `[from, to]` 内的快照
    pub fn between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<&SystemMetrics> {
        self.snapshots
            .iter()
            .filter(|s| s.timestamp >= from && s.timestamp <= to)
            .collect()
    }

    /// 条件是否已持续至少 `duration`：
    /// 窗口开始时刻之前最近的一个快照以及之后的全部快照都满足条件
    pub fn held_for<F>(&self, now: DateTime<Utc>, duration: ChronoDuration, predicate: F) -> bool
    where
        F: Fn(&SystemMetrics) -> bool,
    {
        let start = now - duration;
        let Some(anchor) = self.snapshots.iter().rev().find(|s| s.timestamp <= start) else {
            return false;
        };
        predicate(anchor)
            && self
                .snapshots
                .iter()
                .filter(|s| s.timestamp > start && s.timestamp <= now)
                .all(|s| predicate(s))
    }
}

/// 指标来源
#[async_trait::async_trait]
pub trait MetricsCollector: Send + Sync {
    async fn collect(&self) -> anyhow::Result<SystemMetrics>;
}

/// 从 HealthTracker 读取组件健康
pub struct HealthTrackerCollector {
    health: Arc<dyn HealthTracker>,
}

impl HealthTrackerCollector {
    pub fn new(health: Arc<dyn HealthTracker>) -> Self {
        Self { health }
    }
}

#[async_trait::async_trait]
impl MetricsCollector for HealthTrackerCollector {
    async fn collect(&self) -> anyhow::Result<SystemMetrics> {
        let mut metrics = SystemMetrics::new(Utc::now());
        for health in self.health.all_health().await {
            metrics.component_health.insert(health.component, health.status);
        }
        Ok(metrics)
    }
}

/// 返回预设快照的采集器（时间戳取采集时刻）
#[derive(Default)]
pub struct StaticCollector {
    template: RwLock<Option<SystemMetrics>>,
}

impl StaticCollector {
    pub fn new(template: SystemMetrics) -> Self {
        Self {
            template: RwLock::new(Some(template)),
        }
    }

    pub async fn set(&self, template: SystemMetrics) {
        *self.template.write().await = Some(template);
    }
}

#[async_trait::async_trait]
impl MetricsCollector for StaticCollector {
    async fn collect(&self) -> anyhow::Result<SystemMetrics> {
        let now = Utc::now();
        Ok(match self.template.read().await.as_ref() {
            Some(template) => SystemMetrics {
                timestamp: now,
                ..template.clone()
            },
            None => SystemMetrics::new(now),
        })
    }
}
