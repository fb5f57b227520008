//! 阶段状态与健康查询（只读快照）

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::coordinator::PhaseCoordinator;
use super::monitor::{count_phases, stalled_phase_ids};
use super::registry::TRANSITION_CIRCUIT;
use super::types::{
    ExecutionPriority, ExecutionStatus, JsonMap, PhaseContext, PhaseErrorInfo, PhaseState,
};
use crate::resources::HealthStatus;

#[derive(Debug, Clone, Serialize)]
pub struct ChildStatus {
    pub phase_id: String,
    /// 子阶段尚未初始化时为 None
    pub state: Option<PhaseState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseProgress {
    pub running_seconds: Option<f64>,
    pub execution_time_seconds: Option<f64>,
    pub checkpoint_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NestedExecutionSummary {
    pub execution_id: String,
    pub parent_id: String,
    pub child_id: String,
    pub status: ExecutionStatus,
    pub priority: ExecutionPriority,
    pub elapsed_seconds: f64,
    pub timeout_seconds: u64,
    pub progress_updates: usize,
    pub health_checks: usize,
    pub orphaned: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseStatusReport {
    pub phase_id: String,
    pub phase_type: String,
    pub is_custom_type: bool,
    pub state: PhaseState,
    pub parent_phase_id: Option<String>,
    pub children: Vec<ChildStatus>,
    pub dependencies: Vec<String>,
    pub progress: PhaseProgress,
    pub nested_executions: Vec<NestedExecutionSummary>,
    /// 仅自定义类型：自身起沿 parent_type 上溯的链
    pub inheritance_chain: Option<Vec<String>>,
    pub error_info: Option<PhaseErrorInfo>,
    pub has_result: bool,
    pub metrics: JsonMap,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseHealthReport {
    pub status: HealthStatus,
    pub reasons: Vec<String>,
    pub open_circuits: Vec<String>,
    pub failed_phases: usize,
    pub aborted_phases: usize,
    pub stalled_phases: Vec<String>,
    pub transition_circuit_open: bool,
    pub phases_by_state: BTreeMap<String, usize>,
    pub phases_by_type: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivePhaseInfo {
    pub phase_id: String,
    pub phase_type: String,
    pub state: PhaseState,
    pub running_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentPhaseInfo {
    pub active_phases: Vec<ActivePhaseInfo>,
    /// 最近一次启动的活跃阶段
    pub most_recent: Option<String>,
}

impl PhaseCoordinator {
    pub async fn phase_state(&self, phase_id: &str) -> Option<PhaseState> {
        self.state.read().await.phases.get(phase_id).map(|c| c.state)
    }

    pub async fn phase_context(&self, phase_id: &str) -> Option<PhaseContext> {
        self.state.read().await.phases.get(phase_id).cloned()
    }

    pub async fn get_phase_status(&self, phase_id: &str) -> Option<PhaseStatusReport> {
        let now = Utc::now();
        let (ctx, children, nested_executions) = {
            let state = self.state.read().await;
            let ctx = state.phases.get(phase_id)?.clone();

            let mut child_ids = ctx.child_phases.clone();
            if let Some(known) = state.hierarchy.get(phase_id) {
                child_ids.extend(known.iter().cloned());
            }
            let children: Vec<ChildStatus> = child_ids
                .into_iter()
                .map(|id| ChildStatus {
                    state: state.phases.get(&id).map(|c| c.state),
                    phase_id: id,
                })
                .collect();

            let mut nested: Vec<NestedExecutionSummary> = state
                .executions
                .values()
                .filter(|e| e.parent_id == phase_id || e.child_id == phase_id)
                .map(|e| NestedExecutionSummary {
                    execution_id: e.execution_id.clone(),
                    parent_id: e.parent_id.clone(),
                    child_id: e.child_id.clone(),
                    status: e.status,
                    priority: e.priority,
                    elapsed_seconds: e.elapsed_seconds(e.end_time.unwrap_or(now)),
                    timeout_seconds: e.timeout_seconds,
                    progress_updates: e.progress_updates.len(),
                    health_checks: e.health_checks.len(),
                    orphaned: e.orphaned,
                })
                .collect();
            nested.sort_by(|a, b| a.execution_id.cmp(&b.execution_id));
            (ctx, children, nested)
        };

        let inheritance_chain = if ctx.is_custom_type() {
            Some(self.registry.inheritance_chain(ctx.phase_type.as_str()).await)
        } else {
            None
        };

        Some(PhaseStatusReport {
            progress: PhaseProgress {
                running_seconds: ctx.running_seconds(now),
                execution_time_seconds: ctx
                    .metrics
                    .get("execution_time_seconds")
                    .and_then(|v| v.as_f64()),
                checkpoint_count: ctx.checkpoint_ids.len(),
            },
            phase_id: ctx.phase_id.clone(),
            phase_type: ctx.phase_type.as_str().to_string(),
            is_custom_type: ctx.is_custom_type(),
            state: ctx.state,
            parent_phase_id: ctx.parent_phase_id.clone(),
            children,
            dependencies: ctx.dependencies.iter().cloned().collect(),
            nested_executions,
            inheritance_chain,
            has_result: ctx.result.is_some(),
            error_info: ctx.error_info,
            metrics: ctx.metrics,
            start_time: ctx.start_time,
            end_time: ctx.end_time,
        })
    }

    /// 汇总健康度：有 FAILED → CRITICAL；有 ABORTED → DEGRADED；停滞或熔断打开 → WARNING
    pub async fn get_phase_health(&self) -> PhaseHealthReport {
        let now = Utc::now();
        let (stalled, by_state, by_type, failed, aborted) = {
            let state = self.state.read().await;
            let stalled = stalled_phase_ids(&state, now, self.settings.stall_threshold_secs);
            let (by_state, by_type) = count_phases(&state);
            let failed = state
                .phases
                .values()
                .filter(|c| c.state == PhaseState::Failed)
                .count();
            let aborted = state
                .phases
                .values()
                .filter(|c| c.state == PhaseState::Aborted)
                .count();
            (stalled, by_state, by_type, failed, aborted)
        };

        let mut open_circuits = Vec::new();
        for snapshot in self.registry.breaker_snapshots().await {
            if self.registry.is_circuit_open(&snapshot.name).await {
                open_circuits.push(snapshot.name);
            }
        }
        let transition_circuit_open = open_circuits.iter().any(|c| c == TRANSITION_CIRCUIT);

        let mut reasons = Vec::new();
        if failed > 0 {
            reasons.push(format!("{failed} failed phases"));
        }
        if aborted > 0 {
            reasons.push(format!("{aborted} aborted phases"));
        }
        if !stalled.is_empty() {
            reasons.push(format!("{} stalled phases", stalled.len()));
        }
        if !open_circuits.is_empty() {
            reasons.push(format!("open circuits: {}", open_circuits.join(", ")));
        }

        let status = if failed > 0 {
            HealthStatus::Critical
        } else if aborted > 0 {
            HealthStatus::Degraded
        } else if !stalled.is_empty() || !open_circuits.is_empty() {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        PhaseHealthReport {
            status,
            reasons,
            open_circuits,
            failed_phases: failed,
            aborted_phases: aborted,
            stalled_phases: stalled,
            transition_circuit_open,
            phases_by_state: by_state,
            phases_by_type: by_type,
        }
    }

    pub async fn get_current_phase_info(&self) -> CurrentPhaseInfo {
        let now = Utc::now();
        let state = self.state.read().await;
        let mut active: Vec<&PhaseContext> = state
            .active
            .iter()
            .filter_map(|id| state.phases.get(id))
            .collect();
        active.sort_by_key(|c| c.start_time);

        CurrentPhaseInfo {
            most_recent: active.last().map(|c| c.phase_id.clone()),
            active_phases: active
                .into_iter()
                .map(|c| ActivePhaseInfo {
                    phase_id: c.phase_id.clone(),
                    phase_type: c.phase_type.as_str().to_string(),
                    state: c.state,
                    running_seconds: c.running_seconds(now),
                })
                .collect(),
        }
    }

    #[cfg(test)]
    pub(crate) async fn force_state_for_test(&self, phase_id: &str, target: PhaseState) {
        let mut state = self.state.write().await;
        if let Some(ctx) = state.phases.get_mut(phase_id) {
            ctx.transition(target, Utc::now());
            let snapshot = ctx.clone();
            state.reindex(&snapshot);
        }
    }

    #[cfg(test)]
    pub(crate) async fn insert_execution_for_test(
        &self,
        execution: super::types::NestedPhaseExecution,
    ) {
        self.state
            .write()
            .await
            .executions
            .insert(execution.execution_id.clone(), execution);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::types::{PhaseKind, PhaseType};
    use crate::resources::InMemoryResources;

    #[tokio::test]
    async fn test_health_severity_ordering() {
        let res = InMemoryResources::new();
        let coord = PhaseCoordinator::new(res.handles());
        assert_eq!(coord.get_phase_health().await.status, HealthStatus::Healthy);

        coord.trip_circuit_breaker("phase_zero").await;
        let health = coord.get_phase_health().await;
        assert_eq!(health.status, HealthStatus::Warning);
        assert_eq!(health.open_circuits, vec!["phase_zero"]);
        coord.reset_circuit_breaker("phase_zero").await;

        for id in ["a", "b"] {
            coord
                .initialize_phase(id, PhaseType::One, JsonMap::new(), None, None)
                .await
                .unwrap();
            coord.force_state_for_test(id, PhaseState::Running).await;
        }
        coord.abort_phase("a", "stop").await;
        assert_eq!(coord.get_phase_health().await.status, HealthStatus::Degraded);

        coord.force_state_for_test("b", PhaseState::Failed).await;
        let health = coord.get_phase_health().await;
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(health.failed_phases, 1);
        assert_eq!(health.aborted_phases, 1);
        assert_eq!(health.phases_by_type["phase_one"], 2);
    }

    #[tokio::test]
    async fn test_status_includes_children_and_inheritance() {
        let res = InMemoryResources::new();
        let coord = PhaseCoordinator::new(res.handles());
        coord
            .register_custom_phase_type("phase_audit", "audit", Some("phase_three"), None)
            .await;
        // 子阶段先于父阶段注册
        coord
            .initialize_phase("kid", PhaseType::Zero, JsonMap::new(), Some("top"), None)
            .await
            .unwrap();
        coord
            .initialize_phase("top", PhaseKind::custom("phase_audit"), JsonMap::new(), None, None)
            .await
            .unwrap();
        coord.create_checkpoint("top").await.unwrap();

        let status = coord.get_phase_status("top").await.unwrap();
        assert!(status.is_custom_type);
        assert_eq!(status.children.len(), 1);
        assert_eq!(status.children[0].state, Some(PhaseState::Ready));
        assert_eq!(status.progress.checkpoint_count, 1);
        assert_eq!(
            status.inheritance_chain,
            Some(vec!["phase_audit".to_string(), "phase_three".to_string()])
        );
        assert!(coord.get_phase_status("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_current_phase_info() {
        let res = InMemoryResources::new();
        let coord = PhaseCoordinator::new(res.handles());
        coord
            .initialize_phase("first", PhaseType::One, JsonMap::new(), None, None)
            .await
            .unwrap();
        coord.force_state_for_test("first", PhaseState::Running).await;
        let info = coord.get_current_phase_info().await;
        assert_eq!(info.active_phases.len(), 1);
        assert_eq!(info.most_recent.as_deref(), Some("first"));
        assert_eq!(info.active_phases[0].phase_type, "phase_one");
    }
}
