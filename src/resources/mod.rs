//! 外部协作者接口：事件总线、状态存储、指标、健康追踪
//!
//! 协调与恢复核心只依赖这里的 trait；内存实现用于测试与演示，JSON 文件存储用于本地持久化。

pub mod events;
pub mod health;
pub mod metrics;
pub mod state;

use std::sync::Arc;

pub use events::{
    emit_best_effort, Event, EventBus, EventPriority, EventSubscriber, EventType,
    InMemoryEventBus, SubscriptionId,
};
pub use health::{ComponentHealth, HealthStatus, HealthTracker, InMemoryHealthTracker};
pub use metrics::{InMemoryMetrics, MetricSample, MetricsSink, TracingMetrics};
pub use state::{InMemoryStateStore, JsonFileStateStore, ResourceType, StateEntry, StateStore};

/// 核心组件共享的协作者句柄
#[derive(Clone)]
pub struct Resources {
    pub events: Arc<dyn EventBus>,
    pub state: Arc<dyn StateStore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub health: Arc<dyn HealthTracker>,
}

impl Resources {
    pub fn new(
        events: Arc<dyn EventBus>,
        state: Arc<dyn StateStore>,
        metrics: Arc<dyn MetricsSink>,
        health: Arc<dyn HealthTracker>,
    ) -> Self {
        Self {
            events,
            state,
            metrics,
            health,
        }
    }

    /// 替换状态存储（如换成 JsonFileStateStore）
    pub fn with_state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = state;
        self
    }

    /// 尽力发布事件
    pub async fn emit(&self, event_type: EventType, payload: serde_json::Value, priority: EventPriority) {
        emit_best_effort(self.events.as_ref(), event_type, payload, priority).await;
    }
}

/// 保留具体类型的内存协作者，便于测试与演示读取内部记录
#[derive(Clone, Default)]
pub struct InMemoryResources {
    pub events: Arc<InMemoryEventBus>,
    pub state: Arc<InMemoryStateStore>,
    pub metrics: Arc<InMemoryMetrics>,
    pub health: Arc<InMemoryHealthTracker>,
}

impl InMemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handles(&self) -> Resources {
        Resources::new(
            self.events.clone(),
            self.state.clone(),
            self.metrics.clone(),
            self.health.clone(),
        )
    }
}
