//! 熔断器
//!
//! 每个阶段类型与「transition」伪类型各持有一个熔断器：
//! - CLOSED：正常放行；窗口内失败次数达到阈值后打开
//! - OPEN：快速失败，恢复超时过后进入 HALF_OPEN
//! - HALF_OPEN：最多放行 `half_open_max_tries` 个试探调用，成功达到该数量后关闭，任一失败重新打开；
//!   试探调用被调用方取消时名额不会归还，半开持续超过恢复超时后重新放出名额
//!
//! 状态变化以 `system_health_changed` 事件广播，组件名为 `circuit_breaker_<name>`。

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::core::CoordinatorError;
use crate::resources::{emit_best_effort, EventBus, EventPriority, EventType, HealthStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn health(&self) -> HealthStatus {
        match self {
            CircuitState::Closed => HealthStatus::Healthy,
            CircuitState::HalfOpen => HealthStatus::Degraded,
            CircuitState::Open => HealthStatus::Critical,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// 熔断参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub failure_window_secs: u64,
    #[serde(default = "default_half_open_max_tries")]
    pub half_open_max_tries: u32,
}

fn default_half_open_max_tries() -> u32 {
    1
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout_secs: u64, failure_window_secs: u64) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_secs,
            failure_window_secs,
            half_open_max_tries: default_half_open_max_tries(),
        }
    }

    pub fn with_half_open_max_tries(mut self, tries: u32) -> Self {
        self.half_open_max_tries = tries;
        self
    }

    /// 按阶段类型给出默认值：phase_two / phase_three 运行更久，容忍更多失败
    pub fn default_for(circuit: &str) -> Self {
        match circuit {
            "phase_two" => Self::new(5, 120, 600),
            "phase_three" => Self::new(4, 90, 450),
            _ => Self::new(3, 60, 300),
        }
    }

    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.failure_threshold == 0 {
            return Err(CoordinatorError::InvalidCircuitConfig(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.failure_window_secs == 0 {
            return Err(CoordinatorError::InvalidCircuitConfig(
                "failure_window_secs must be at least 1".into(),
            ));
        }
        if self.half_open_max_tries == 0 {
            return Err(CoordinatorError::InvalidCircuitConfig(
                "half_open_max_tries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new(3, 60, 300)
    }
}

/// 经熔断器执行的结果
#[derive(Error, Debug)]
pub enum CircuitError<E> {
    /// 熔断打开（或半开试探名额已满），调用未执行
    #[error("Circuit {name} is open")]
    Open { name: String },

    #[error("{0}")]
    Inner(E),
}

/// 熔断器只读快照
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub config: CircuitBreakerConfig,
    pub last_state_change: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_at: Option<Instant>,
    half_open_calls: u32,
    half_open_successes: u32,
    last_state_change: DateTime<Utc>,
}

impl Inner {
    /// 切换状态；返回 (旧状态, 新状态) 供锁外发事件
    fn move_to(&mut self, state: CircuitState) -> Option<(CircuitState, CircuitState)> {
        if self.state == state {
            return None;
        }
        let previous = self.state;
        self.state = state;
        self.last_state_change = Utc::now();
        self.half_open_calls = 0;
        self.half_open_successes = 0;
        self.half_open_at = None;
        match state {
            CircuitState::Open => self.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                self.failure_count = 0;
                self.opened_at = None;
            }
            CircuitState::HalfOpen => self.half_open_at = Some(Instant::now()),
        }
        Some((previous, state))
    }

    fn recovery_elapsed(&self) -> bool {
        let timeout = Duration::from_secs(self.config.recovery_timeout_secs);
        self.opened_at.map_or(true, |t| t.elapsed() >= timeout)
    }

    /// 半开名额用尽且已超过恢复超时：占着名额的试探多半已被取消
    fn half_open_stale(&self) -> bool {
        let timeout = Duration::from_secs(self.config.recovery_timeout_secs);
        self.half_open_at.map_or(true, |t| t.elapsed() >= timeout)
    }

    /// 收回半开名额，重新计时
    fn rearm_half_open(&mut self) {
        self.half_open_calls = 0;
        self.half_open_successes = 0;
        self.half_open_at = Some(Instant::now());
    }
}

pub struct CircuitBreaker {
    name: String,
    inner: Mutex<Inner>,
    events: Option<Arc<dyn EventBus>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                config,
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                opened_at: None,
                half_open_at: None,
                half_open_calls: 0,
                half_open_successes: 0,
                last_state_change: Utc::now(),
            }),
            events: None,
        }
    }

    /// 状态变化时发布健康事件
    pub fn with_events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// 是否处于打开状态（恢复超时已过的 OPEN 视为可试探，不算打开）
    pub async fn is_open(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.state == CircuitState::Open && !inner.recovery_elapsed()
    }

    pub async fn config(&self) -> CircuitBreakerConfig {
        self.inner.lock().await.config
    }

    pub async fn update_config(&self, config: CircuitBreakerConfig) {
        self.inner.lock().await.config = config;
        tracing::info!("Circuit {} config updated: {:?}", self.name, config);
    }

    pub async fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().await;
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            config: inner.config,
            last_state_change: inner.last_state_change,
        }
    }

    /// 经熔断器执行 `op`；任何 Err 都计为一次失败
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.before_call().await?;
        match op().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure().await;
                Err(CircuitError::Inner(e))
            }
        }
    }

    async fn before_call<E>(&self) -> Result<(), CircuitError<E>> {
        let change = {
            let mut inner = self.inner.lock().await;
            let mut change = None;
            if inner.state == CircuitState::Open {
                if !inner.recovery_elapsed() {
                    return Err(CircuitError::Open {
                        name: self.name.clone(),
                    });
                }
                change = inner.move_to(CircuitState::HalfOpen);
            }
            if inner.state == CircuitState::HalfOpen {
                if inner.half_open_calls >= inner.config.half_open_max_tries && inner.half_open_stale() {
                    tracing::warn!(
                        "Circuit {} half-open trials never settled, releasing {} slot(s)",
                        self.name,
                        inner.half_open_calls
                    );
                    inner.rearm_half_open();
                }
                if inner.half_open_calls >= inner.config.half_open_max_tries {
                    drop(inner);
                    self.announce(change).await;
                    return Err(CircuitError::Open {
                        name: self.name.clone(),
                    });
                }
                inner.half_open_calls += 1;
            }
            change
        };
        self.announce(change).await;
        Ok(())
    }

    async fn on_success(&self) {
        let change = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= inner.config.half_open_max_tries {
                        inner.move_to(CircuitState::Closed)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        self.announce(change).await;
    }

    async fn on_failure(&self) {
        let change = {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            let window = Duration::from_secs(inner.config.failure_window_secs);
            if inner
                .last_failure
                .map_or(false, |last| now.duration_since(last) > window)
            {
                inner.failure_count = 0;
            }
            inner.failure_count += 1;
            inner.last_failure = Some(now);

            match inner.state {
                CircuitState::HalfOpen => inner.move_to(CircuitState::Open),
                CircuitState::Closed if inner.failure_count >= inner.config.failure_threshold => {
                    inner.move_to(CircuitState::Open)
                }
                _ => None,
            }
        };
        if let Some((_, CircuitState::Open)) = change {
            tracing::warn!("Circuit {} opened", self.name);
        }
        self.announce(change).await;
    }

    /// 人工打开
    pub async fn trip(&self) {
        let change = self.inner.lock().await.move_to(CircuitState::Open);
        self.announce(change).await;
    }

    /// 人工复位
    pub async fn reset(&self) {
        let change = {
            let mut inner = self.inner.lock().await;
            inner.failure_count = 0;
            inner.last_failure = None;
            inner.move_to(CircuitState::Closed)
        };
        self.announce(change).await;
    }

    async fn announce(&self, change: Option<(CircuitState, CircuitState)>) {
        let Some((previous, current)) = change else {
            return;
        };
        tracing::info!("Circuit {} {} -> {}", self.name, previous, current);
        if let Some(events) = &self.events {
            emit_best_effort(
                events.as_ref(),
                EventType::SystemHealthChanged,
                json!({
                    "component": format!("circuit_breaker_{}", self.name),
                    "status": current.health(),
                    "description": format!("Circuit breaker {} state changed from {} to {}", self.name, previous, current),
                    "metadata": {
                        "previous_state": previous,
                        "new_state": current,
                    },
                    "timestamp": Utc::now().to_rfc3339(),
                }),
                if current == CircuitState::Open {
                    EventPriority::High
                } else {
                    EventPriority::Normal
                },
            )
            .await;
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
