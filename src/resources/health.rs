//! 组件健康状态

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// 健康等级（按严重程度递增排序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Warning => "WARNING",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unhealthy => "UNHEALTHY",
            HealthStatus::Critical => "CRITICAL",
        }
    }

    /// UNHEALTHY / CRITICAL 视为组件失效
    pub fn is_failing(&self) -> bool {
        *self >= HealthStatus::Unhealthy
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 组件健康记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub description: String,
    #[serde(default)]
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait HealthTracker: Send + Sync {
    async fn update_health(
        &self,
        component: &str,
        status: HealthStatus,
        description: &str,
        metadata: Value,
    );

    async fn get_health(&self, component: &str) -> Option<ComponentHealth>;

    async fn all_health(&self) -> Vec<ComponentHealth>;
}

#[derive(Default)]
pub struct InMemoryHealthTracker {
    records: RwLock<HashMap<String, ComponentHealth>>,
}

impl InMemoryHealthTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HealthTracker for InMemoryHealthTracker {
    async fn update_health(
        &self,
        component: &str,
        status: HealthStatus,
        description: &str,
        metadata: Value,
    ) {
        let record = ComponentHealth {
            component: component.to_string(),
            status,
            description: description.to_string(),
            metadata,
            updated_at: Utc::now(),
        };
        let previous = self
            .records
            .write()
            .await
            .insert(component.to_string(), record);
        if previous.map(|p| p.status) != Some(status) {
            tracing::debug!("Health of {} is now {}", component, status);
        }
    }

    async fn get_health(&self, component: &str) -> Option<ComponentHealth> {
        self.records.read().await.get(component).cloned()
    }

    async fn all_health(&self) -> Vec<ComponentHealth> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.component.cmp(&b.component));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_ordering() {
        assert!(HealthStatus::Critical > HealthStatus::Degraded);
        assert!(HealthStatus::Unhealthy.is_failing());
        assert!(!HealthStatus::Degraded.is_failing());
        assert_eq!(serde_json::to_value(HealthStatus::Critical).unwrap(), json!("CRITICAL"));
    }

    #[tokio::test]
    async fn test_update_overwrites() {
        let tracker = InMemoryHealthTracker::new();
        tracker
            .update_health("c1", HealthStatus::Degraded, "slow", json!({}))
            .await;
        tracker
            .update_health("c1", HealthStatus::Critical, "down", json!({"severity": "FATAL"}))
            .await;
        let health = tracker.get_health("c1").await.unwrap();
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(tracker.all_health().await.len(), 1);
    }
}
