//! 指标记录
//!
//! 指标只用于观测，协调器与恢复层从不读回指标做控制决策。

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

#[async_trait::async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, name: &str, value: f64, metadata: Value);
}

/// 一条指标样本
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub metadata: Value,
    pub recorded_at: DateTime<Utc>,
}

/// 内存指标缓冲（有界）
pub struct InMemoryMetrics {
    samples: RwLock<Vec<MetricSample>>,
    capacity: usize,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self {
            samples: RwLock::new(Vec::new()),
            capacity: 10_000,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub async fn samples(&self) -> Vec<MetricSample> {
        self.samples.read().await.clone()
    }

    pub async fn samples_named(&self, name: &str) -> Vec<MetricSample> {
        self.samples
            .read()
            .await
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    /// 最近一次同名样本的值
    pub async fn latest(&self, name: &str) -> Option<f64> {
        self.samples
            .read()
            .await
            .iter()
            .rev()
            .find(|s| s.name == name)
            .map(|s| s.value)
    }
}

impl Default for InMemoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetricsSink for InMemoryMetrics {
    async fn record(&self, name: &str, value: f64, metadata: Value) {
        let mut samples = self.samples.write().await;
        samples.push(MetricSample {
            name: name.to_string(),
            value,
            metadata,
            recorded_at: Utc::now(),
        });
        if samples.len() > self.capacity {
            let overflow = samples.len() - self.capacity;
            samples.drain(..overflow);
        }
    }
}

/// 将指标写入 tracing（debug 级别）
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

#[async_trait::async_trait]
impl MetricsSink for TracingMetrics {
    async fn record(&self, name: &str, value: f64, metadata: Value) {
        tracing::debug!(metric = name, value, %metadata, "metric recorded");
    }
}
