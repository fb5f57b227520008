//! 事件总线
//!
//! 协调器与恢复层只通过 `EventBus` 发布事件；事件类型是封闭枚举，字符串名即对外契约。
//! `InMemoryEventBus` 保留有界历史并并发分发给订阅者，订阅者出错只记录日志。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::ResourceError;

/// 事件类型（字符串名保持稳定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PhaseStateChanged,
    SystemHealthChanged,
    ResourceErrorOccurred,
    ResourceErrorResolved,
    ResourceErrorRecoveryStarted,
    ResourceErrorRecoveryCompleted,
    ResourceAlertCreated,
    ResourceScalingRequested,
    FallbackSystemActivated,
    DevelopmentBlockersCleared,
    ChangesRollbackRequested,
    /// 载荷中的 `event_type` 字段区分 checkpoint_created / phase_registered 等子事件
    #[serde(rename = "phase_coordination_event")]
    PhaseCoordination,
    MonitoringAlert,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PhaseStateChanged => "phase_state_changed",
            EventType::SystemHealthChanged => "system_health_changed",
            EventType::ResourceErrorOccurred => "resource_error_occurred",
            EventType::ResourceErrorResolved => "resource_error_resolved",
            EventType::ResourceErrorRecoveryStarted => "resource_error_recovery_started",
            EventType::ResourceErrorRecoveryCompleted => "resource_error_recovery_completed",
            EventType::ResourceAlertCreated => "resource_alert_created",
            EventType::ResourceScalingRequested => "resource_scaling_requested",
            EventType::FallbackSystemActivated => "fallback_system_activated",
            EventType::DevelopmentBlockersCleared => "development_blockers_cleared",
            EventType::ChangesRollbackRequested => "changes_rollback_requested",
            EventType::PhaseCoordination => "phase_coordination_event",
            EventType::MonitoringAlert => "monitoring_alert",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// 已发布的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub priority: EventPriority,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// 载荷中的嵌套子事件名（仅 phase_coordination_event 使用）
    pub fn sub_type(&self) -> Option<&str> {
        self.payload.get("event_type").and_then(Value::as_str)
    }
}

pub type SubscriptionId = String;

/// 事件订阅者
#[async_trait::async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// 异步发布/订阅通道
#[async_trait::async_trait]
pub trait EventBus: Send + Sync {
    async fn emit(
        &self,
        event_type: EventType,
        payload: Value,
        priority: EventPriority,
    ) -> Result<(), ResourceError>;

    async fn subscribe(
        &self,
        event_type: EventType,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionId;

    async fn unsubscribe(&self, id: &str) -> bool;
}

/// 尽力发布：失败只记录日志，调用方不受影响
pub async fn emit_best_effort(
    bus: &dyn EventBus,
    event_type: EventType,
    payload: Value,
    priority: EventPriority,
) {
    if let Err(e) = bus.emit(event_type, payload, priority).await {
        tracing::warn!("Failed to emit {} event: {}", event_type, e);
    }
}

type SubscriberList = Vec<(SubscriptionId, Arc<dyn EventSubscriber>)>;

/// 进程内事件总线
pub struct InMemoryEventBus {
    subscribers: RwLock<HashMap<EventType, SubscriberList>>,
    history: RwLock<Vec<Event>>,
    max_history: usize,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            max_history: 1000,
        }
    }

    /// 设置历史保留上限
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    /// 所有已发布事件（按发布顺序）
    pub async fn history(&self) -> Vec<Event> {
        self.history.read().await.clone()
    }

    /// 指定类型的已发布事件
    pub async fn events_of(&self, event_type: EventType) -> Vec<Event> {
        self.history
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub async fn clear_history(&self) {
        self.history.write().await.clear();
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventBus for InMemoryEventBus {
    async fn emit(
        &self,
        event_type: EventType,
        payload: Value,
        priority: EventPriority,
    ) -> Result<(), ResourceError> {
        let event = Event {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            payload,
            priority,
            timestamp: Utc::now(),
        };

        {
            let mut history = self.history.write().await;
            history.push(event.clone());
            if history.len() > self.max_history {
                let overflow = history.len() - self.max_history;
                history.drain(..overflow);
            }
        }

        let targets: Vec<Arc<dyn EventSubscriber>> = self
            .subscribers
            .read()
            .await
            .get(&event_type)
            .map(|list| list.iter().map(|(_, s)| Arc::clone(s)).collect())
            .unwrap_or_default();

        if targets.is_empty() {
            return Ok(());
        }

        let results =
            futures_util::future::join_all(targets.iter().map(|s| s.handle(&event))).await;
        for result in results {
            if let Err(e) = result {
                tracing::warn!("Subscriber for {} failed: {}", event_type, e);
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        event_type: EventType,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionId {
        let id = format!("sub_{}", uuid::Uuid::new_v4());
        self.subscribers
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push((id.clone(), subscriber));
        id
    }

    async fn unsubscribe(&self, id: &str) -> bool {
        let mut subscribers = self.subscribers.write().await;
        for list in subscribers.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait::async_trait]
    impl EventSubscriber for Counter {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl EventSubscriber for Failing {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("subscriber exploded")
        }
    }

    #[test]
    fn test_event_type_names_are_stable() {
        assert_eq!(EventType::PhaseCoordination.as_str(), "phase_coordination_event");
        assert_eq!(
            serde_json::to_value(EventType::PhaseCoordination).unwrap(),
            json!("phase_coordination_event")
        );
        assert_eq!(
            serde_json::to_value(EventType::ResourceErrorOccurred).unwrap(),
            json!(EventType::ResourceErrorOccurred.as_str())
        );
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let bus = InMemoryEventBus::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let id = bus
            .subscribe(EventType::MonitoringAlert, counter.clone())
            .await;

        bus.emit(EventType::MonitoringAlert, json!({}), EventPriority::High)
            .await
            .unwrap();
        bus.emit(EventType::SystemHealthChanged, json!({}), EventPriority::Normal)
            .await
            .unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(&id).await);
        assert!(!bus.unsubscribe(&id).await);
        bus.emit(EventType::MonitoringAlert, json!({}), EventPriority::High)
            .await
            .unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(bus.history().await.len(), 3);
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_fail_emit() {
        let bus = InMemoryEventBus::new();
        bus.subscribe(EventType::ResourceAlertCreated, Arc::new(Failing))
            .await;
        let result = bus
            .emit(
                EventType::ResourceAlertCreated,
                json!({"alert_type": "x"}),
                EventPriority::High,
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let bus = InMemoryEventBus::new().with_max_history(2);
        for i in 0..5 {
            bus.emit(
                EventType::PhaseCoordination,
                json!({"event_type": "phase_message", "n": i}),
                EventPriority::Normal,
            )
            .await
            .unwrap();
        }
        let history = bus.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].payload["n"], 4);
        assert_eq!(history[1].sub_type(), Some("phase_message"));
    }
}
