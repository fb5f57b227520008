//! 阶段协调器：生命周期状态机
//!
//! INITIALIZING → READY → RUNNING → (PAUSED ↔ RUNNING) → COMPLETED | FAILED | ABORTED
//!
//! - 所有阶段状态、嵌套执行、检查点都保存在单一 RwLock 之下的私有状态中，按 ID 索引、只增不删
//! - 锁内只做内存迁移，持久化与事件发布在锁外完成
//! - start_phase 与嵌套协调都经熔断器执行；熔断打开返回 `circuit_open` 结构化结果
//!
//! 嵌套执行、检查点、巡检与状态查询分别在同目录的 nested / checkpoint / monitor / status 中实现。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};

use super::circuit::{CircuitBreakerConfig, CircuitError, CircuitSnapshot};
use super::executor::{PhaseExecutor, SimulatedExecutor};
use super::handlers::{HandlerRegistry, PhaseTransitionHandler};
use super::registry::{PhaseRegistry, TRANSITION_CIRCUIT};
use super::types::{
    Checkpoint, JsonMap, NestedPhaseExecution, PhaseContext, PhaseErrorInfo, PhaseKind,
    PhaseRunResult, PhaseState, PhaseType,
};
use crate::core::{CoordinatorError, LoopHandle, PhaseFailure};
use crate::resources::{EventPriority, EventType, HealthStatus, ResourceType, Resources};

/// 熔断器配置在 StateStore 中的键
pub const CIRCUIT_CONFIG_KEY: &str = "phase_coordinator:circuit_breaker_configs";

/// 嵌套执行的升级档位：已用时间超过超时的 `elapsed_percent`，且空闲超过 `idle_secs`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EscalationTier {
    pub elapsed_percent: f64,
    pub idle_secs: u64,
}

/// 协调器运行参数
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub monitor_interval: Duration,
    pub monitor_error_backoff: Duration,
    /// RUNNING 超过该秒数视为停滞（只告警，不自动失败）
    pub stall_threshold_secs: u64,
    pub warning_tier: EscalationTier,
    pub critical_tier: EscalationTier,
    pub stop_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(60),
            monitor_error_backoff: Duration::from_secs(10),
            stall_threshold_secs: 3600,
            warning_tier: EscalationTier {
                elapsed_percent: 50.0,
                idle_secs: 1800,
            },
            critical_tier: EscalationTier {
                elapsed_percent: 75.0,
                idle_secs: 900,
            },
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// 协调器私有状态
#[derive(Default)]
pub(super) struct CoordinatorState {
    pub(super) phases: HashMap<String, PhaseContext>,
    pub(super) active: BTreeSet<String>,
    /// 父 → 子；父阶段可以晚于子阶段注册
    pub(super) hierarchy: HashMap<String, BTreeSet<String>>,
    pub(super) dependencies: HashMap<String, BTreeSet<String>>,
    pub(super) checkpoints: HashMap<String, Checkpoint>,
    pub(super) executions: HashMap<String, NestedPhaseExecution>,
    pub(super) handlers: HashMap<String, Vec<Arc<dyn PhaseTransitionHandler>>>,
}

impl CoordinatorState {
    /// 从上下文重建层级与依赖索引（恢复检查点后调用）
    ///
    /// 检查点之后登记的子阶段仍然存在并指向本阶段，因此保持关联；
    /// 已存储上下文的 `child_phases` 与层级索引同步。
    pub(super) fn reindex(&mut self, ctx: &PhaseContext) {
        if let Some(parent) = &ctx.parent_phase_id {
            self.hierarchy
                .entry(parent.clone())
                .or_default()
                .insert(ctx.phase_id.clone());
            if let Some(parent_ctx) = self.phases.get_mut(parent) {
                parent_ctx.child_phases.insert(ctx.phase_id.clone());
            }
        }
        let children = self.hierarchy.entry(ctx.phase_id.clone()).or_default();
        children.extend(ctx.child_phases.iter().cloned());
        let children = children.clone();
        if let Some(stored) = self.phases.get_mut(&ctx.phase_id) {
            stored.child_phases = children;
        }
        self.dependencies
            .insert(ctx.phase_id.clone(), ctx.dependencies.clone());
        if matches!(ctx.state, PhaseState::Running | PhaseState::Paused) {
            self.active.insert(ctx.phase_id.clone());
        } else {
            self.active.remove(&ctx.phase_id);
        }
    }

    pub(super) fn is_child_of(&self, parent: &str, child: &str) -> bool {
        self.hierarchy
            .get(parent)
            .map_or(false, |children| children.contains(child))
            || self
                .phases
                .get(parent)
                .map_or(false, |p| p.child_phases.contains(child))
    }
}

/// 自定义 / 内置类型的目录条目
#[derive(Debug, Clone, Serialize)]
pub struct PhaseTypeEntry {
    pub id: String,
    pub description: String,
    pub parent_type: Option<String>,
    pub active_phases: usize,
    pub circuit_open: bool,
    pub registered_at: Option<DateTime<Utc>>,
}

/// get_registered_phase_types 的只读快照
#[derive(Debug, Clone, Serialize)]
pub struct PhaseTypeCatalog {
    pub built_in: Vec<PhaseTypeEntry>,
    pub custom: Vec<PhaseTypeEntry>,
    pub inheritance: BTreeMap<String, Vec<String>>,
    pub built_in_count: usize,
    pub custom_count: usize,
}

pub struct PhaseCoordinator {
    pub(super) state: RwLock<CoordinatorState>,
    pub(super) registry: PhaseRegistry,
    pub(super) handler_registry: HandlerRegistry,
    pub(super) executor: Arc<dyn PhaseExecutor>,
    pub(super) resources: Resources,
    pub(super) settings: CoordinatorSettings,
    pub(super) monitor: Mutex<Option<LoopHandle>>,
}

impl PhaseCoordinator {
    pub fn new(resources: Resources) -> Self {
        Self {
            state: RwLock::new(CoordinatorState::default()),
            registry: PhaseRegistry::new(Some(resources.events.clone())),
            handler_registry: HandlerRegistry::new(),
            executor: Arc::new(SimulatedExecutor::new()),
            resources,
            settings: CoordinatorSettings::default(),
            monitor: Mutex::new(None),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 构造期覆盖熔断器配置（键为阶段类型名或 `transition`）
    pub fn with_circuit_configs(mut self, configs: HashMap<String, CircuitBreakerConfig>) -> Self {
        self.registry = self.registry.with_overrides(configs);
        self
    }

    pub fn with_handler_registry(mut self, handler_registry: HandlerRegistry) -> Self {
        self.handler_registry = handler_registry;
        self
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn handler_registry(&self) -> &HandlerRegistry {
        &self.handler_registry
    }

    /// 从 StateStore 载入运维调整过的熔断器配置
    pub async fn initialize(&self) -> Result<(), CoordinatorError> {
        let Some(entry) = self.resources.state.get(CIRCUIT_CONFIG_KEY).await? else {
            tracing::info!("No persisted circuit breaker configs, using defaults");
            return Ok(());
        };
        let configs: BTreeMap<String, CircuitBreakerConfig> = serde_json::from_value(entry.state)?;
        for (name, config) in configs {
            if self.registry.breaker(&name).await.is_none() {
                tracing::debug!("Skipping persisted config for unknown circuit {}", name);
                continue;
            }
            if let Err(e) = self.registry.update_config(&name, config).await {
                tracing::warn!("Ignoring persisted config for {}: {}", name, e);
            }
        }
        tracing::info!("Loaded persisted circuit breaker configs");
        Ok(())
    }

    /// 初始化并启动后台巡检
    pub async fn start(self: &Arc<Self>) -> Result<(), CoordinatorError> {
        self.initialize().await?;
        self.start_monitoring().await;
        Ok(())
    }

    /// 停止后台巡检（有界等待）
    pub async fn stop(&self) {
        self.stop_monitoring().await;
    }

    /// 关闭协调器：停止巡检并记录仍处于活动状态的阶段
    pub async fn shutdown(&self) {
        self.stop().await;
        let active = self.state.read().await.active.len();
        if active > 0 {
            tracing::warn!("Phase coordinator shut down with {} active phases", active);
        } else {
            tracing::info!("Phase coordinator shut down");
        }
    }

    /// 初始化阶段：校验类型、登记父子与依赖、直接进入 READY
    pub async fn initialize_phase(
        &self,
        phase_id: &str,
        phase_type: impl Into<PhaseKind>,
        config: JsonMap,
        parent_phase_id: Option<&str>,
        metadata: Option<JsonMap>,
    ) -> Result<(), CoordinatorError> {
        let kind = phase_type.into();
        if !self.registry.is_valid_kind(&kind).await {
            tracing::error!("Invalid phase type {} for phase {}", kind, phase_id);
            return Err(CoordinatorError::InvalidPhaseType(kind.to_string()));
        }

        let handlers = self.handler_registry.build_from_config(&config).await;
        let dependencies = parse_dependencies(&config);
        let now = Utc::now();

        let snapshot = {
            let mut state = self.state.write().await;
            if state.phases.contains_key(phase_id) {
                tracing::warn!("Phase {} already exists", phase_id);
                return Err(CoordinatorError::PhaseExists(phase_id.to_string()));
            }

            let mut ctx = PhaseContext::new(phase_id, kind);
            ctx.parent_phase_id = parent_phase_id.map(str::to_string);
            ctx.dependencies = dependencies;
            ctx.config = config;
            ctx.metadata = metadata.unwrap_or_default();
            if let Some(children) = state.hierarchy.get(phase_id) {
                ctx.child_phases = children.clone();
            }
            ctx.transition(PhaseState::Ready, now);

            state.reindex(&ctx);
            if !handlers.is_empty() {
                state.handlers.insert(phase_id.to_string(), handlers);
            }
            state.phases.insert(phase_id.to_string(), ctx.clone());
            ctx
        };

        tracing::info!(
            "Initialized phase {} ({}) parent={:?}",
            phase_id,
            snapshot.phase_type,
            snapshot.parent_phase_id
        );
        self.publish_state_change(&snapshot, PhaseState::Initializing)
            .await;
        self.resources
            .metrics
            .record(
                "phase_coordinator:phase_initialized",
                1.0,
                json!({
                    "phase_id": phase_id,
                    "phase_type": snapshot.phase_type.as_str(),
                    "parent_phase_id": snapshot.parent_phase_id,
                    "dependency_count": snapshot.dependencies.len(),
                }),
            )
            .await;
        Ok(())
    }

    /// 启动阶段；依赖未完成返回 `dependency_error`，熔断打开返回 `circuit_open`，均不改变阶段状态
    pub async fn start_phase(&self, phase_id: &str, input: JsonMap) -> PhaseRunResult {
        let (kind, current, unfulfilled) = {
            let state = self.state.read().await;
            let Some(ctx) = state.phases.get(phase_id) else {
                tracing::warn!("Cannot start unknown phase {}", phase_id);
                return PhaseRunResult::not_found(phase_id);
            };
            let unfulfilled: Vec<String> = ctx
                .dependencies
                .iter()
                .filter(|dep| {
                    state.phases.get(*dep).map(|d| d.state) != Some(PhaseState::Completed)
                })
                .cloned()
                .collect();
            (ctx.phase_type.clone(), ctx.state, unfulfilled)
        };

        if !unfulfilled.is_empty() {
            tracing::warn!(
                "Phase {} has unfulfilled dependencies: {:?}",
                phase_id,
                unfulfilled
            );
            return PhaseRunResult::dependency_error(phase_id, &kind, unfulfilled);
        }
        if matches!(current, PhaseState::Running | PhaseState::Paused) {
            return PhaseRunResult::error(
                phase_id,
                Some(&kind),
                "InvalidStateTransition",
                format!("Phase {phase_id} is already {current}"),
            );
        }

        let Some(breaker) = self.registry.breaker(kind.as_str()).await else {
            return PhaseRunResult::error(
                phase_id,
                Some(&kind),
                "InvalidPhaseType",
                format!("No circuit breaker for phase type {kind}"),
            );
        };

        match breaker.execute(|| self.execute_phase(phase_id, input)).await {
            Ok(output) => PhaseRunResult::success(phase_id, &kind, output),
            Err(CircuitError::Open { name }) => {
                tracing::warn!("Circuit {} open, phase {} not started", name, phase_id);
                self.resources
                    .metrics
                    .record(
                        "phase_coordinator:circuit_rejected",
                        1.0,
                        json!({"phase_id": phase_id, "circuit": name}),
                    )
                    .await;
                PhaseRunResult::circuit_open(phase_id, Some(&kind), &name)
            }
            Err(CircuitError::Inner(failure)) => {
                PhaseRunResult::error(phase_id, Some(&kind), failure.error_type, failure.message)
            }
        }
    }

    /// 标记 RUNNING → 调用执行器 → COMPLETED / FAILED；失败时把错误返回给熔断器
    async fn execute_phase(&self, phase_id: &str, input: JsonMap) -> Result<JsonMap, PhaseFailure> {
        let started = {
            let mut state = self.state.write().await;
            let Some(ctx) = state.phases.get_mut(phase_id) else {
                return Err(PhaseFailure::new("UnknownPhase", format!("Phase {phase_id} not found")));
            };
            if matches!(ctx.state, PhaseState::Running | PhaseState::Paused) {
                return Err(PhaseFailure::new(
                    "InvalidStateTransition",
                    format!("Phase {phase_id} is already {}", ctx.state),
                ));
            }
            let previous = ctx.transition(PhaseState::Running, Utc::now());
            let snapshot = ctx.clone();
            state.active.insert(phase_id.to_string());
            (snapshot, previous)
        };
        self.publish_state_change(&started.0, started.1).await;

        let outcome = self.executor.execute(&started.0, input).await;
        let now = Utc::now();

        let finished = {
            let mut state = self.state.write().await;
            let mut changed = None;
            if let Some(ctx) = state.phases.get_mut(phase_id) {
                if matches!(ctx.state, PhaseState::Running | PhaseState::Paused) {
                    let previous = match &outcome {
                        Ok(output) => {
                            ctx.result = Some(output.clone());
                            ctx.error_info = None;
                            ctx.transition(PhaseState::Completed, now)
                        }
                        Err(failure) => {
                            ctx.error_info = Some(PhaseErrorInfo {
                                error: failure.message.clone(),
                                error_type: failure.error_type.clone(),
                                timestamp: now,
                            });
                            ctx.transition(PhaseState::Failed, now)
                        }
                    };
                    if let Some(secs) = ctx.running_seconds(now) {
                        ctx.metrics
                            .insert("execution_time_seconds".into(), json!(secs));
                    }
                    changed = Some((ctx.clone(), previous));
                } else {
                    tracing::info!(
                        "Phase {} finished work while {}, keeping state",
                        phase_id,
                        ctx.state
                    );
                }
            }
            if changed.is_some() {
                state.active.remove(phase_id);
            }
            changed
        };

        if let Some((snapshot, previous)) = finished {
            self.publish_state_change(&snapshot, previous).await;
            let (name, succeeded) = match &outcome {
                Ok(_) => ("phase_coordinator:phase_completed", true),
                Err(_) => ("phase_coordinator:phase_failed", false),
            };
            self.resources
                .metrics
                .record(
                    name,
                    1.0,
                    json!({
                        "phase_id": phase_id,
                        "phase_type": snapshot.phase_type.as_str(),
                        "success": succeeded,
                        "execution_time_seconds": snapshot.metrics.get("execution_time_seconds"),
                    }),
                )
                .await;
        }

        if let Err(failure) = &outcome {
            tracing::error!("Phase {} failed: {}", phase_id, failure);
        }
        outcome
    }

    /// RUNNING → PAUSED；其他状态返回 false
    pub async fn pause_phase(&self, phase_id: &str, reason: &str) -> bool {
        let Some((snapshot, previous, handlers)) = self
            .guarded_transition(phase_id, &[PhaseState::Running], PhaseState::Paused, |ctx| {
                ctx.metadata.insert("pause_reason".into(), json!(reason));
            })
            .await
        else {
            return false;
        };
        self.publish_state_change(&snapshot, previous).await;
        for handler in handlers {
            if let Err(e) = handler.on_pause(phase_id, reason).await {
                tracing::warn!("on_pause handler {} failed for {}: {}", handler.name(), phase_id, e);
            }
        }
        true
    }

    /// PAUSED → RUNNING；其他状态返回 false
    pub async fn resume_phase(&self, phase_id: &str) -> bool {
        let Some((snapshot, previous, handlers)) = self
            .guarded_transition(phase_id, &[PhaseState::Paused], PhaseState::Running, |ctx| {
                ctx.metadata.remove("pause_reason");
            })
            .await
        else {
            return false;
        };
        self.publish_state_change(&snapshot, previous).await;
        for handler in handlers {
            if let Err(e) = handler.on_resume(phase_id).await {
                tracing::warn!("on_resume handler {} failed for {}: {}", handler.name(), phase_id, e);
            }
        }
        true
    }

    /// RUNNING / PAUSED → ABORTED（协作式：不打断执行器中的工作）
    pub async fn abort_phase(&self, phase_id: &str, reason: &str) -> bool {
        let Some((snapshot, previous, _)) = self
            .guarded_transition(
                phase_id,
                &[PhaseState::Running, PhaseState::Paused],
                PhaseState::Aborted,
                |ctx| {
                    ctx.metadata.insert("abort_reason".into(), json!(reason));
                },
            )
            .await
        else {
            return false;
        };
        tracing::warn!("Phase {} aborted: {}", phase_id, reason);
        self.publish_state_change(&snapshot, previous).await;
        self.resources
            .metrics
            .record(
                "phase_coordinator:phase_aborted",
                1.0,
                json!({"phase_id": phase_id, "reason": reason}),
            )
            .await;
        true
    }

    /// 仅当当前状态在 `allowed` 中时迁移；同时维护活跃集合
    async fn guarded_transition<F>(
        &self,
        phase_id: &str,
        allowed: &[PhaseState],
        target: PhaseState,
        mutate: F,
    ) -> Option<(PhaseContext, PhaseState, Vec<Arc<dyn PhaseTransitionHandler>>)>
    where
        F: FnOnce(&mut PhaseContext),
    {
        let mut state = self.state.write().await;
        let handlers = state.handlers.get(phase_id).cloned().unwrap_or_default();
        let Some(ctx) = state.phases.get_mut(phase_id) else {
            tracing::warn!("Cannot move unknown phase {} to {}", phase_id, target);
            return None;
        };
        if !allowed.contains(&ctx.state) {
            tracing::warn!(
                "Illegal transition for phase {}: {} -> {}",
                phase_id,
                ctx.state,
                target
            );
            return None;
        }
        mutate(ctx);
        let previous = ctx.transition(target, Utc::now());
        let snapshot = ctx.clone();
        if target.is_terminal() {
            state.active.remove(phase_id);
        } else {
            state.active.insert(phase_id.to_string());
        }
        Some((snapshot, previous, handlers))
    }

    /// 注册自定义阶段类型
    pub async fn register_custom_phase_type(
        &self,
        type_id: &str,
        description: &str,
        parent_type: Option<&str>,
        config: Option<JsonMap>,
    ) -> bool {
        match self
            .registry
            .register_custom(type_id, description, parent_type, config.unwrap_or_default())
            .await
        {
            Ok(replaced) => {
                if replaced {
                    tracing::warn!("Custom phase type {} re-registered, overwriting", type_id);
                } else {
                    tracing::info!("Registered custom phase type {}", type_id);
                }
                self.resources
                    .emit(
                        EventType::PhaseCoordination,
                        json!({
                            "event_type": "phase_registered",
                            "phase_type": type_id,
                            "description": description,
                            "parent_type": parent_type,
                            "replaced": replaced,
                            "timestamp": Utc::now().to_rfc3339(),
                        }),
                        EventPriority::Normal,
                    )
                    .await;
                true
            }
            Err(e) => {
                tracing::error!("Failed to register custom phase type {}: {}", type_id, e);
                false
            }
        }
    }

    /// 注销自定义阶段类型；仍有非终态阶段使用时拒绝
    pub async fn unregister_custom_phase_type(&self, type_id: &str) -> bool {
        let in_use = {
            let state = self.state.read().await;
            state
                .phases
                .values()
                .filter(|ctx| ctx.phase_type.as_str() == type_id && !ctx.state.is_terminal())
                .count()
        };
        if in_use > 0 {
            tracing::warn!(
                "{}",
                CoordinatorError::PhaseTypeInUse(format!("{type_id} ({in_use} live phases)"))
            );
            return false;
        }

        match self.registry.unregister_custom(type_id).await {
            Some(_) => {
                tracing::info!("Unregistered custom phase type {}", type_id);
                self.resources
                    .emit(
                        EventType::PhaseCoordination,
                        json!({
                            "event_type": "phase_unregistered",
                            "phase_type": type_id,
                            "timestamp": Utc::now().to_rfc3339(),
                        }),
                        EventPriority::Normal,
                    )
                    .await;
                true
            }
            None => {
                tracing::warn!("Custom phase type {} is not registered", type_id);
                false
            }
        }
    }

    pub async fn is_valid_phase_type(&self, value: &str) -> bool {
        self.registry.is_valid(value).await
    }

    /// 解析阶段类型字符串（内置或已注册自定义）
    pub async fn resolve_phase_type(&self, value: &str) -> Option<PhaseKind> {
        self.registry.resolve(value).await
    }

    pub async fn get_registered_phase_types(&self) -> PhaseTypeCatalog {
        let active_counts: HashMap<String, usize> = {
            let state = self.state.read().await;
            let mut counts = HashMap::new();
            for id in &state.active {
                if let Some(ctx) = state.phases.get(id) {
                    *counts.entry(ctx.phase_type.as_str().to_string()).or_insert(0) += 1;
                }
            }
            counts
        };

        let mut built_in = Vec::new();
        for t in PhaseType::ALL {
            built_in.push(PhaseTypeEntry {
                id: t.as_str().to_string(),
                description: t.description().to_string(),
                parent_type: None,
                active_phases: active_counts.get(t.as_str()).copied().unwrap_or(0),
                circuit_open: self.registry.is_circuit_open(t.as_str()).await,
                registered_at: None,
            });
        }

        let mut custom = Vec::new();
        for t in self.registry.custom_types().await {
            custom.push(PhaseTypeEntry {
                active_phases: active_counts.get(&t.id).copied().unwrap_or(0),
                circuit_open: self.registry.is_circuit_open(&t.id).await,
                id: t.id,
                description: t.description,
                parent_type: t.parent_type,
                registered_at: Some(t.registered_at),
            });
        }

        PhaseTypeCatalog {
            built_in_count: built_in.len(),
            custom_count: custom.len(),
            built_in,
            custom,
            inheritance: self.registry.inheritance_map().await,
        }
    }

    /// 更新某类型（或 `transition`）的熔断器配置并持久化
    pub async fn update_circuit_breaker_config(
        &self,
        circuit: &str,
        config: CircuitBreakerConfig,
    ) -> Result<(), CoordinatorError> {
        if circuit != TRANSITION_CIRCUIT && !self.registry.is_valid(circuit).await {
            return Err(CoordinatorError::InvalidPhaseType(circuit.to_string()));
        }
        self.registry.update_config(circuit, config).await?;
        self.persist_circuit_configs().await?;
        tracing::info!("Circuit breaker config for {} updated", circuit);
        Ok(())
    }

    async fn persist_circuit_configs(&self) -> Result<(), CoordinatorError> {
        let configs = self.registry.configs().await;
        self.resources
            .state
            .set(
                CIRCUIT_CONFIG_KEY,
                serde_json::to_value(&configs)?,
                ResourceType::Config,
                Some(json!({"updated_at": Utc::now().to_rfc3339()})),
            )
            .await?;
        Ok(())
    }

    /// 人工打开熔断器
    pub async fn trip_circuit_breaker(&self, circuit: &str) -> bool {
        match self.registry.breaker(circuit).await {
            Some(breaker) => {
                breaker.trip().await;
                true
            }
            None => false,
        }
    }

    /// 人工复位熔断器
    pub async fn reset_circuit_breaker(&self, circuit: &str) -> bool {
        match self.registry.breaker(circuit).await {
            Some(breaker) => {
                breaker.reset().await;
                true
            }
            None => false,
        }
    }

    pub async fn get_circuit_breaker_status(&self) -> Vec<CircuitSnapshot> {
        self.registry.breaker_snapshots().await
    }

    /// 持久化阶段快照并发布状态变化与健康事件（尽力而为）
    pub(super) async fn publish_state_change(&self, ctx: &PhaseContext, previous: PhaseState) {
        let key = format!("phase:{}:state", ctx.phase_id);
        match serde_json::to_value(ctx) {
            Ok(value) => {
                if let Err(e) = self
                    .resources
                    .state
                    .set(
                        &key,
                        value,
                        ResourceType::State,
                        Some(json!({"previous_state": previous})),
                    )
                    .await
                {
                    tracing::warn!("Failed to persist state of phase {}: {}", ctx.phase_id, e);
                }
            }
            Err(e) => tracing::warn!("Failed to serialize phase {}: {}", ctx.phase_id, e),
        }

        let timestamp = Utc::now().to_rfc3339();
        self.resources
            .emit(
                EventType::PhaseStateChanged,
                json!({
                    "phase_id": ctx.phase_id,
                    "phase_type": ctx.phase_type.as_str(),
                    "is_custom_type": ctx.is_custom_type(),
                    "state": ctx.state,
                    "previous_state": previous,
                    "parent_phase_id": ctx.parent_phase_id,
                    "timestamp": timestamp,
                }),
                EventPriority::Normal,
            )
            .await;

        let health = if matches!(ctx.state, PhaseState::Running | PhaseState::Completed) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        self.resources
            .emit(
                EventType::SystemHealthChanged,
                json!({
                    "component": format!("phase_{}", ctx.phase_id),
                    "status": health,
                    "description": format!("Phase {} is {}", ctx.phase_id, ctx.state),
                    "metadata": {"phase_type": ctx.phase_type.as_str()},
                    "timestamp": timestamp,
                }),
                EventPriority::Normal,
            )
            .await;
    }
}

fn parse_dependencies(config: &JsonMap) -> BTreeSet<String> {
    match config.get("dependencies") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => BTreeSet::new(),
    }
}
