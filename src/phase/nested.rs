//! 嵌套阶段执行：父阶段驱动子阶段
//!
//! 整个协调调用经 `transition` 熔断器保护。每一步写入 progress_updates 并刷新 last_activity，
//! 巡检据此判断执行是否仍在推进。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use super::circuit::CircuitError;
use super::coordinator::PhaseCoordinator;
use super::handlers::PhaseTransitionHandler;
use super::registry::TRANSITION_CIRCUIT;
use super::types::{
    ExecutionMetadata, ExecutionPriority, ExecutionStatus, JsonMap, NestedPhaseExecution, PhaseKind,
    PhaseRunResult, RunStatus,
};
use crate::core::{CoordinatorError, PhaseFailure};

/// coordinate_nested_execution 的可选参数
#[derive(Debug, Clone, Default)]
pub struct NestedExecutionOptions {
    /// 不指定时按子阶段类型取默认超时
    pub timeout_seconds: Option<u64>,
    pub priority: ExecutionPriority,
    pub metadata: JsonMap,
    pub checkpoint_before: bool,
    pub checkpoint_after: bool,
}

impl NestedExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_priority(mut self, priority: ExecutionPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_checkpoints(mut self, before: bool, after: bool) -> Self {
        self.checkpoint_before = before;
        self.checkpoint_after = after;
        self
    }
}

impl PhaseCoordinator {
    /// 协调父阶段执行子阶段
    ///
    /// 子阶段不是父阶段登记的子阶段时直接返回 `NotAChild`；
    /// 子阶段失败且无处理器恢复时返回 `NestedExecutionFailed`（进度轨迹已写入日志）。
    pub async fn coordinate_nested_execution(
        &self,
        parent_id: &str,
        child_id: &str,
        input: JsonMap,
        options: NestedExecutionOptions,
    ) -> Result<PhaseRunResult, CoordinatorError> {
        let child_kind = {
            let state = self.state.read().await;
            if !state.phases.contains_key(parent_id) {
                return Err(CoordinatorError::UnknownPhase(parent_id.to_string()));
            }
            let Some(child) = state.phases.get(child_id) else {
                return Err(CoordinatorError::UnknownPhase(child_id.to_string()));
            };
            if !state.is_child_of(parent_id, child_id) {
                tracing::error!("Phase {} is not a child of {}", child_id, parent_id);
                return Err(CoordinatorError::NotAChild {
                    parent: parent_id.to_string(),
                    child: child_id.to_string(),
                });
            }
            child.phase_type.clone()
        };

        let breaker = self
            .registry
            .breaker(TRANSITION_CIRCUIT)
            .await
            .ok_or_else(|| CoordinatorError::InvalidPhaseType(TRANSITION_CIRCUIT.to_string()))?;

        match breaker
            .execute(|| self.run_nested(parent_id, child_id, &child_kind, input, options))
            .await
        {
            Ok(result) => Ok(result),
            Err(CircuitError::Open { name }) => {
                tracing::warn!(
                    "Circuit {} open, nested execution {} -> {} rejected",
                    name,
                    parent_id,
                    child_id
                );
                Ok(PhaseRunResult::circuit_open(child_id, Some(&child_kind), &name))
            }
            Err(CircuitError::Inner(e)) => Err(e),
        }
    }

    async fn run_nested(
        &self,
        parent_id: &str,
        child_id: &str,
        child_kind: &PhaseKind,
        input: JsonMap,
        options: NestedExecutionOptions,
    ) -> Result<PhaseRunResult, CoordinatorError> {
        let now = Utc::now();
        let timeout_seconds = options
            .timeout_seconds
            .unwrap_or_else(|| child_kind.default_nested_timeout());
        let execution_id = format!(
            "{}_to_{}_{}_{}",
            parent_id,
            child_id,
            now.timestamp_micros(),
            &Uuid::new_v4().simple().to_string()[..8]
        );

        let mut execution = NestedPhaseExecution::new(
            &execution_id,
            parent_id,
            child_id,
            timeout_seconds,
            options.priority,
            now,
        );
        execution.metadata = options.metadata.clone();
        execution.record_progress(
            "initialization",
            json!({"timeout_seconds": timeout_seconds, "priority": options.priority}),
            now,
        );

        let (handlers, parent_context) = {
            let mut state = self.state.write().await;
            state.executions.insert(execution_id.clone(), execution);
            let handlers = merged_handlers(
                state.handlers.get(parent_id),
                state.handlers.get(child_id),
            );
            let parent_context = state.phases.get(parent_id).map(|p| {
                json!({
                    "phase_id": p.phase_id,
                    "phase_type": p.phase_type.as_str(),
                    "execution_context": p.config.get("execution_context").cloned().unwrap_or(Value::Null),
                })
            });
            (handlers, parent_context)
        };

        tracing::info!(
            "Nested execution {} started ({} -> {}, timeout {}s)",
            execution_id,
            parent_id,
            child_id,
            timeout_seconds
        );
        self.resources
            .metrics
            .record(
                "phase_coordinator:nested_execution_started",
                1.0,
                json!({
                    "execution_id": execution_id,
                    "parent_id": parent_id,
                    "child_id": child_id,
                    "timeout_seconds": timeout_seconds,
                }),
            )
            .await;

        if options.checkpoint_before {
            match self.create_checkpoint(child_id).await {
                Ok(id) => {
                    self.update_execution(&execution_id, |e| e.checkpoints.before = Some(id))
                        .await;
                }
                Err(e) => tracing::warn!("Pre-execution checkpoint for {} failed: {}", child_id, e),
            }
        }

        let mut enriched = input;
        enriched.insert(
            "parent_context".into(),
            parent_context.unwrap_or(Value::Null),
        );
        enriched.insert("execution_id".into(), json!(execution_id));
        enriched.insert("timeout_seconds".into(), json!(timeout_seconds));
        self.record_execution_progress(
            &execution_id,
            "context_prepared",
            json!({"input_keys": enriched.keys().collect::<Vec<_>>()}),
        )
        .await;

        self.record_execution_progress(&execution_id, "handlers", json!({"count": handlers.len()}))
            .await;
        for (i, handler) in handlers.iter().enumerate() {
            match handler.before_start(child_id, enriched.clone()).await {
                Ok(next) => {
                    enriched = next;
                    self.record_execution_progress(
                        &execution_id,
                        &format!("handler_{i}"),
                        json!({"handler": handler.name()}),
                    )
                    .await;
                }
                Err(e) => {
                    tracing::warn!("before_start handler {} failed: {}", handler.name(), e);
                    self.record_execution_progress(
                        &execution_id,
                        &format!("handler_{i}_error"),
                        json!({"handler": handler.name(), "error": e.to_string()}),
                    )
                    .await;
                }
            }
        }

        self.record_execution_progress(&execution_id, "child_phase_starting", Value::Null)
            .await;
        let result = self.start_phase(child_id, enriched.clone()).await;
        self.record_execution_progress(
            &execution_id,
            "child_phase_completed",
            json!({"status": result.status}),
        )
        .await;

        match result.status {
            RunStatus::Success | RunStatus::Recovered => {
                self.finish_success(parent_id, child_id, &execution_id, &handlers, result, &options)
                    .await
            }
            RunStatus::Error => {
                let failure = PhaseFailure::new(
                    result
                        .error_type
                        .clone()
                        .unwrap_or_else(|| "PhaseExecutionError".to_string()),
                    result.error.clone().unwrap_or_default(),
                );
                self.recover_or_fail(
                    parent_id,
                    child_id,
                    child_kind,
                    &execution_id,
                    &handlers,
                    failure,
                    enriched,
                )
                .await
            }
            _ => {
                // 依赖未满足 / 子类型熔断：结构化返回给调用方，执行记录标记失败
                let message = result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("child finished with {:?}", result.status));
                let now = Utc::now();
                let snapshot = self
                    .update_execution(&execution_id, |e| {
                        e.fail(message.clone(), now);
                    })
                    .await;
                tracing::warn!("Nested execution {} not run: {}", execution_id, message);
                let mut result = result;
                result.execution_metadata = snapshot.map(|e| execution_metadata(&e));
                Ok(result)
            }
        }
    }

    async fn finish_success(
        &self,
        parent_id: &str,
        child_id: &str,
        execution_id: &str,
        handlers: &[Arc<dyn PhaseTransitionHandler>],
        result: PhaseRunResult,
        options: &NestedExecutionOptions,
    ) -> Result<PhaseRunResult, CoordinatorError> {
        self.record_execution_progress(execution_id, "post_handlers", json!({"count": handlers.len()}))
            .await;
        let mut result = result;
        for handler in handlers.iter().rev() {
            match handler.after_completion(child_id, result.clone()).await {
                Ok(next) => result = next,
                Err(e) => {
                    tracing::warn!("after_completion handler {} failed: {}", handler.name(), e)
                }
            }
        }

        if options.checkpoint_after {
            match self.create_checkpoint(child_id).await {
                Ok(id) => {
                    self.update_execution(execution_id, |e| e.checkpoints.after = Some(id))
                        .await;
                }
                Err(e) => tracing::warn!("Post-execution checkpoint for {} failed: {}", child_id, e),
            }
        }

        let now = Utc::now();
        {
            let mut state = self.state.write().await;
            if let Some(parent) = state.phases.get_mut(parent_id) {
                parent.metrics.insert(
                    format!("child_phase_{child_id}"),
                    json!({
                        "execution_id": execution_id,
                        "status": "completed",
                        "completed_at": now.to_rfc3339(),
                    }),
                );
            }
        }

        self.record_execution_progress(execution_id, "completion", Value::Null)
            .await;
        let output = result.output.clone();
        let snapshot = self
            .update_execution(execution_id, |e| {
                e.complete(output, now);
            })
            .await;

        if let Some(execution) = &snapshot {
            tracing::info!(
                "Nested execution {} completed in {:.1}s",
                execution_id,
                execution.elapsed_seconds(now)
            );
            self.resources
                .metrics
                .record(
                    "phase_coordinator:nested_execution_completed",
                    execution.elapsed_seconds(now),
                    json!({"execution_id": execution_id, "parent_id": parent_id, "child_id": child_id}),
                )
                .await;
            result.execution_metadata = Some(execution_metadata(execution));
        }
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn recover_or_fail(
        &self,
        parent_id: &str,
        child_id: &str,
        child_kind: &PhaseKind,
        execution_id: &str,
        handlers: &[Arc<dyn PhaseTransitionHandler>],
        failure: PhaseFailure,
        input: JsonMap,
    ) -> Result<PhaseRunResult, CoordinatorError> {
        self.record_execution_progress(
            execution_id,
            "execution_error",
            json!({"error": failure.message, "error_type": failure.error_type}),
        )
        .await;
        self.record_execution_progress(execution_id, "recovery_attempt", json!({"handlers": handlers.len()}))
            .await;

        let mut context = JsonMap::new();
        context.insert("execution_id".into(), json!(execution_id));
        context.insert("parent_id".into(), json!(parent_id));
        context.insert("child_id".into(), json!(child_id));
        context.insert("input".into(), Value::Object(input));

        let mut recovered = None;
        for (i, handler) in handlers.iter().enumerate() {
            let name = format!("recovery_handler_{i}");
            match handler.on_failure(child_id, &failure, &context).await {
                Ok(Some(output)) => {
                    self.record_execution_progress(
                        execution_id,
                        &name,
                        json!({"handler": handler.name(), "recovered": true}),
                    )
                    .await;
                    recovered = Some(output);
                    break;
                }
                Ok(None) => {
                    self.record_execution_progress(
                        execution_id,
                        &name,
                        json!({"handler": handler.name(), "recovered": false}),
                    )
                    .await;
                }
                Err(e) => {
                    tracing::warn!("on_failure handler {} failed: {}", handler.name(), e);
                    self.record_execution_progress(
                        execution_id,
                        &name,
                        json!({"handler": handler.name(), "error": e.to_string()}),
                    )
                    .await;
                }
            }
        }

        let now = Utc::now();
        if let Some(output) = recovered {
            self.record_execution_progress(execution_id, "recovery_succeeded", Value::Null)
                .await;
            let recorded = output.clone();
            let snapshot = self
                .update_execution(execution_id, |e| {
                    e.recover(recorded, now);
                })
                .await;
            tracing::info!("Nested execution {} recovered by handler", execution_id);
            self.resources
                .metrics
                .record(
                    "phase_coordinator:nested_execution_recovered",
                    1.0,
                    json!({"execution_id": execution_id, "error_type": failure.error_type}),
                )
                .await;

            let mut result = PhaseRunResult::success(child_id, child_kind, output);
            result.status = RunStatus::Recovered;
            result.error = Some(failure.message);
            result.error_type = Some(failure.error_type);
            result.execution_metadata = snapshot.map(|e| execution_metadata(&e));
            return Ok(result);
        }

        self.record_execution_progress(execution_id, "recovery_failed", Value::Null)
            .await;
        let snapshot = self
            .update_execution(execution_id, |e| {
                e.fail(failure.to_string(), now);
            })
            .await;

        tracing::error!(
            "Nested execution {} failed and no handler recovered it: {}",
            execution_id,
            failure
        );
        if let Some(execution) = &snapshot {
            for update in &execution.progress_updates {
                tracing::error!(
                    "  [{}] {} {}",
                    update.timestamp.to_rfc3339(),
                    update.name,
                    update.details
                );
            }
        }
        self.resources
            .metrics
            .record(
                "phase_coordinator:nested_execution_failed",
                1.0,
                json!({"execution_id": execution_id, "error_type": failure.error_type}),
            )
            .await;

        Err(CoordinatorError::NestedExecutionFailed {
            execution_id: execution_id.to_string(),
            error_type: failure.error_type,
            message: failure.message,
        })
    }

    /// 记录一次进度更新并刷新 last_activity；未知执行返回 false
    pub async fn record_execution_progress(
        &self,
        execution_id: &str,
        name: &str,
        details: Value,
    ) -> bool {
        let now = Utc::now();
        self.update_execution(execution_id, |e| e.record_progress(name, details, now))
            .await
            .is_some()
    }

    pub async fn get_nested_execution(&self, execution_id: &str) -> Option<NestedPhaseExecution> {
        self.state.read().await.executions.get(execution_id).cloned()
    }

    /// 与某阶段相关（作为父或子）的嵌套执行，按开始时间排序
    pub async fn nested_executions_for(&self, phase_id: &str) -> Vec<NestedPhaseExecution> {
        let state = self.state.read().await;
        let mut executions: Vec<_> = state
            .executions
            .values()
            .filter(|e| e.parent_id == phase_id || e.child_id == phase_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.start_time);
        executions
    }

    async fn update_execution<F>(&self, execution_id: &str, f: F) -> Option<NestedPhaseExecution>
    where
        F: FnOnce(&mut NestedPhaseExecution),
    {
        let mut state = self.state.write().await;
        let execution = state.executions.get_mut(execution_id)?;
        f(execution);
        Some(execution.clone())
    }
}

/// 父阶段处理器在前、子阶段在后，按名称去重
fn merged_handlers(
    parent: Option<&Vec<Arc<dyn PhaseTransitionHandler>>>,
    child: Option<&Vec<Arc<dyn PhaseTransitionHandler>>>,
) -> Vec<Arc<dyn PhaseTransitionHandler>> {
    let mut seen = HashSet::new();
    parent
        .into_iter()
        .chain(child)
        .flatten()
        .filter(|h| seen.insert(h.name().to_string()))
        .cloned()
        .collect()
}

fn execution_metadata(execution: &NestedPhaseExecution) -> ExecutionMetadata {
    ExecutionMetadata {
        execution_id: execution.execution_id.clone(),
        checkpoints: execution.checkpoints.clone(),
        recovered: execution.status == ExecutionStatus::Recovered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::executor::{PhaseExecutor, SimulatedExecutor};
    use crate::phase::handlers::HandlerRegistry;
    use crate::phase::types::{PhaseContext, PhaseState, PhaseType};
    use crate::resources::InMemoryResources;
    use std::time::Duration;

    /// 对指定阶段失败，其余回显
    struct FailFor(&'static str);

    #[async_trait::async_trait]
    impl PhaseExecutor for FailFor {
        async fn execute(&self, ctx: &PhaseContext, input: JsonMap) -> Result<JsonMap, PhaseFailure> {
            if ctx.phase_id == self.0 {
                return Err(PhaseFailure::new("ValidationError", "bad component spec"));
            }
            Ok(input)
        }
    }

    struct Rescuer;

    #[async_trait::async_trait]
    impl PhaseTransitionHandler for Rescuer {
        fn name(&self) -> &str {
            "rescuer"
        }

        async fn on_failure(
            &self,
            _phase_id: &str,
            error: &PhaseFailure,
            _context: &JsonMap,
        ) -> anyhow::Result<Option<JsonMap>> {
            let mut out = JsonMap::new();
            out.insert("rescued_from".into(), json!(error.error_type));
            Ok(Some(out))
        }
    }

    struct Stamp;

    #[async_trait::async_trait]
    impl PhaseTransitionHandler for Stamp {
        fn name(&self) -> &str {
            "stamp"
        }

        async fn before_start(&self, _phase_id: &str, mut input: JsonMap) -> anyhow::Result<JsonMap> {
            input.insert("stamped".into(), json!(true));
            Ok(input)
        }
    }

    async fn with_handlers() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry
            .register("rescuer", |_c: &JsonMap| Arc::new(Rescuer) as Arc<dyn PhaseTransitionHandler>)
            .await;
        registry
            .register("stamp", |_c: &JsonMap| Arc::new(Stamp) as Arc<dyn PhaseTransitionHandler>)
            .await;
        registry
    }

    fn handler_config(names: &[&str]) -> JsonMap {
        let mut config = JsonMap::new();
        config.insert("transition_handlers".into(), json!(names));
        config.insert("execution_context".into(), json!({"garden": "north"}));
        config
    }

    #[tokio::test]
    async fn test_nested_success_with_checkpoints() {
        let res = InMemoryResources::new();
        let coord = PhaseCoordinator::new(res.handles())
            .with_executor(Arc::new(SimulatedExecutor::new().with_delay(Duration::ZERO)));
        coord
            .initialize_phase("p1", PhaseType::One, JsonMap::new(), None, None)
            .await
            .unwrap();
        coord
            .initialize_phase("p2", PhaseType::Two, JsonMap::new(), Some("p1"), None)
            .await
            .unwrap();

        let result = coord
            .coordinate_nested_execution(
                "p1",
                "p2",
                JsonMap::new(),
                NestedExecutionOptions::new().with_checkpoints(true, true),
            )
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(coord.phase_state("p2").await, Some(PhaseState::Completed));

        let meta = result.execution_metadata.unwrap();
        assert!(meta.checkpoints.before.is_some());
        assert!(meta.checkpoints.after.is_some());
        assert!(!meta.recovered);

        let execution = coord.get_nested_execution(&meta.execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.timeout_seconds, 3600);
        assert!(execution.has_progress("child_phase_completed"));
        assert!(execution.has_progress("completion"));

        let parent = coord.phase_context("p1").await.unwrap();
        assert!(parent.metrics.contains_key("child_phase_p2"));
    }

    #[tokio::test]
    async fn test_not_a_child_is_rejected() {
        let res = InMemoryResources::new();
        let coord = PhaseCoordinator::new(res.handles());
        coord
            .initialize_phase("a", PhaseType::One, JsonMap::new(), None, None)
            .await
            .unwrap();
        coord
            .initialize_phase("b", PhaseType::One, JsonMap::new(), None, None)
            .await
            .unwrap();
        let err = coord
            .coordinate_nested_execution("a", "b", JsonMap::new(), NestedExecutionOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NotAChild { .. }));
    }

    #[tokio::test]
    async fn test_failure_recovered_by_handler() {
        let res = InMemoryResources::new();
        let coord = PhaseCoordinator::new(res.handles())
            .with_executor(Arc::new(FailFor("child")))
            .with_handler_registry(with_handlers().await);
        coord
            .initialize_phase("parent", PhaseType::Three, handler_config(&["stamp"]), None, None)
            .await
            .unwrap();
        coord
            .initialize_phase(
                "child",
                PhaseType::Four,
                handler_config(&["stamp", "rescuer"]),
                Some("parent"),
                None,
            )
            .await
            .unwrap();

        let result = coord
            .coordinate_nested_execution("parent", "child", JsonMap::new(), NestedExecutionOptions::new())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Recovered);
        assert_eq!(result.output["rescued_from"], "ValidationError");

        let meta = result.execution_metadata.unwrap();
        assert!(meta.recovered);
        let execution = coord.get_nested_execution(&meta.execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Recovered);
        assert_eq!(execution.timeout_seconds, 7200);
        assert!(execution.has_progress("recovery_handler_0"));
        assert!(execution.has_progress("recovery_succeeded"));
        // stamp 去重后只保留一次
        assert!(execution.has_progress("handler_0"));
        assert!(execution.has_progress("handler_1"));
        assert!(!execution.has_progress("handler_2"));
    }

    #[tokio::test]
    async fn test_unrecovered_failure_returns_error() {
        let res = InMemoryResources::new();
        let coord = PhaseCoordinator::new(res.handles()).with_executor(Arc::new(FailFor("child")));
        coord
            .initialize_phase("parent", PhaseType::One, JsonMap::new(), None, None)
            .await
            .unwrap();
        coord
            .initialize_phase("child", PhaseType::One, JsonMap::new(), Some("parent"), None)
            .await
            .unwrap();

        let err = coord
            .coordinate_nested_execution(
                "parent",
                "child",
                JsonMap::new(),
                NestedExecutionOptions::new().with_timeout(60),
            )
            .await
            .unwrap_err();
        let CoordinatorError::NestedExecutionFailed { execution_id, error_type, .. } = err else {
            panic!("expected NestedExecutionFailed");
        };
        assert_eq!(error_type, "ValidationError");
        let execution = coord.get_nested_execution(&execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.has_progress("recovery_failed"));
        assert_eq!(coord.phase_state("child").await, Some(PhaseState::Failed));
    }

    #[tokio::test]
    async fn test_enriched_input_reaches_child() {
        let res = InMemoryResources::new();
        let coord = PhaseCoordinator::new(res.handles())
            .with_executor(Arc::new(FailFor("nobody")))
            .with_handler_registry(with_handlers().await);
        coord
            .initialize_phase("p", PhaseType::One, handler_config(&[]), None, None)
            .await
            .unwrap();
        coord
            .initialize_phase("c", PhaseType::Zero, handler_config(&["stamp"]), Some("p"), None)
            .await
            .unwrap();

        let result = coord
            .coordinate_nested_execution("p", "c", JsonMap::new(), NestedExecutionOptions::new())
            .await
            .unwrap();
        assert_eq!(result.output["stamped"], true);
        assert_eq!(result.output["timeout_seconds"], 1800);
        assert_eq!(result.output["parent_context"]["execution_context"]["garden"], "north");
    }
}
