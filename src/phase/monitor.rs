//! 后台巡检：阶段停滞与嵌套执行的分级升级
//!
//! - RUNNING 超过 stall_threshold 的阶段只告警，不自动失败
//! - 嵌套执行两级升级：warning（超时 50% 且空闲 30 分钟）、critical（超时 75% 且空闲 15 分钟）
//! - 超过超时的执行标记为 orphaned 并失败，同时发布高优先级错误事件

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::coordinator::{CoordinatorState, EscalationTier, PhaseCoordinator};
use super::types::{ExecutionStatus, NestedPhaseExecution, PhaseState};
use crate::core::{CoordinatorError, LoopHandle};
use crate::resources::{EventPriority, EventType, HealthStatus};

/// 单次巡检结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorCycleReport {
    pub stalled_phases: Vec<String>,
    pub warning_executions: Vec<String>,
    pub critical_executions: Vec<String>,
    pub orphaned_executions: Vec<String>,
}

struct Escalation {
    execution: NestedPhaseExecution,
    severity: HealthStatus,
    elapsed_seconds: f64,
    idle_seconds: f64,
}

impl PhaseCoordinator {
    pub(super) async fn start_monitoring(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().await;
        if slot.as_ref().map_or(false, |h| h.is_running()) {
            tracing::debug!("Phase monitor already running");
            return;
        }

        let weak = Arc::downgrade(self);
        let handle = LoopHandle::spawn(
            "phase_monitor",
            CancellationToken::new(),
            self.settings.monitor_interval,
            self.settings.monitor_error_backoff,
            move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(coordinator) => coordinator
                            .run_monitor_cycle(Utc::now())
                            .await
                            .map(|_| ())
                            .map_err(anyhow::Error::from),
                        None => Ok(()),
                    }
                }
            },
        );
        *slot = Some(handle);
    }

    pub(super) async fn stop_monitoring(&self) {
        let handle = self.monitor.lock().await.take();
        if let Some(handle) = handle {
            if !handle.stop(self.settings.stop_timeout).await {
                tracing::warn!("Phase monitor did not stop within {:?}", self.settings.stop_timeout);
            }
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .await
            .as_ref()
            .map_or(false, |h| h.is_running())
    }

    /// 执行一次巡检；`now` 由调用方注入
    pub async fn run_monitor_cycle(
        &self,
        now: DateTime<Utc>,
    ) -> Result<MonitorCycleReport, CoordinatorError> {
        let mut report = MonitorCycleReport::default();

        let (by_state, by_type) = {
            let state = self.state.read().await;
            report.stalled_phases =
                stalled_phase_ids(&state, now, self.settings.stall_threshold_secs);
            count_phases(&state)
        };

        let (escalations, orphaned) = {
            let mut state = self.state.write().await;
            scan_executions(
                &mut state,
                now,
                self.settings.warning_tier,
                self.settings.critical_tier,
            )
        };

        for phase_id in &report.stalled_phases {
            tracing::warn!(
                "Phase {} has been running longer than {}s",
                phase_id,
                self.settings.stall_threshold_secs
            );
            self.resources
                .emit(
                    EventType::ResourceAlertCreated,
                    json!({
                        "alert_type": "phase_stalled",
                        "severity": HealthStatus::Warning,
                        "phase_id": phase_id,
                        "threshold_seconds": self.settings.stall_threshold_secs,
                        "timestamp": now.to_rfc3339(),
                    }),
                    EventPriority::Normal,
                )
                .await;
        }

        for escalation in escalations {
            let execution = &escalation.execution;
            let critical = escalation.severity == HealthStatus::Critical;
            if critical {
                tracing::error!(
                    "Nested execution {} critical: {:.0}s elapsed, idle {:.0}s",
                    execution.execution_id,
                    escalation.elapsed_seconds,
                    escalation.idle_seconds
                );
                report.critical_executions.push(execution.execution_id.clone());
            } else {
                tracing::warn!(
                    "Nested execution {} slow: {:.0}s elapsed, idle {:.0}s",
                    execution.execution_id,
                    escalation.elapsed_seconds,
                    escalation.idle_seconds
                );
                report.warning_executions.push(execution.execution_id.clone());
            }
            self.resources
                .emit(
                    EventType::ResourceAlertCreated,
                    json!({
                        "alert_type": "nested_execution_stalled",
                        "severity": escalation.severity,
                        "execution_id": execution.execution_id,
                        "parent_id": execution.parent_id,
                        "child_id": execution.child_id,
                        "elapsed_seconds": escalation.elapsed_seconds,
                        "idle_seconds": escalation.idle_seconds,
                        "timeout_seconds": execution.timeout_seconds,
                        "progress_updates": execution.progress_updates.len(),
                        "timestamp": now.to_rfc3339(),
                    }),
                    if critical {
                        EventPriority::High
                    } else {
                        EventPriority::Normal
                    },
                )
                .await;
        }

        for execution in orphaned {
            let message = execution.error.clone().unwrap_or_default();
            tracing::error!("{} ({})", message, execution.execution_id);
            self.resources
                .emit(
                    EventType::ResourceErrorOccurred,
                    json!({
                        "error_type": "orphaned_execution",
                        "severity": HealthStatus::Critical,
                        "component_id": execution.parent_id,
                        "execution_id": execution.execution_id,
                        "child_id": execution.child_id,
                        "message": message,
                        "health_checks": execution.health_checks.len(),
                        "progress_updates": execution.progress_updates.len(),
                        "timestamp": now.to_rfc3339(),
                    }),
                    EventPriority::High,
                )
                .await;
            self.resources
                .metrics
                .record(
                    "phase_coordinator:orphaned_execution",
                    1.0,
                    json!({"execution_id": execution.execution_id}),
                )
                .await;
            report.orphaned_executions.push(execution.execution_id);
        }

        for (state, count) in by_state {
            self.resources
                .metrics
                .record(
                    &format!("phase_coordinator:phases_by_state:{state}"),
                    count as f64,
                    json!({}),
                )
                .await;
        }
        for (phase_type, count) in by_type {
            self.resources
                .metrics
                .record(
                    &format!("phase_coordinator:phases_by_type:{phase_type}"),
                    count as f64,
                    json!({}),
                )
                .await;
        }
        self.resources
            .metrics
            .record(
                "phase_coordinator:stalled_phases",
                report.stalled_phases.len() as f64,
                json!({"phase_ids": report.stalled_phases}),
            )
            .await;

        Ok(report)
    }
}

/// RUNNING 时长超过阈值的活跃阶段
pub(super) fn stalled_phase_ids(
    state: &CoordinatorState,
    now: DateTime<Utc>,
    threshold_secs: u64,
) -> Vec<String> {
    state
        .active
        .iter()
        .filter_map(|id| state.phases.get(id))
        .filter(|ctx| ctx.state == PhaseState::Running)
        .filter(|ctx| {
            ctx.running_seconds(now)
                .map_or(false, |secs| secs > threshold_secs as f64)
        })
        .map(|ctx| ctx.phase_id.clone())
        .collect()
}

pub(super) fn count_phases(
    state: &CoordinatorState,
) -> (BTreeMap<String, usize>, BTreeMap<String, usize>) {
    let mut by_state = BTreeMap::new();
    let mut by_type = BTreeMap::new();
    for ctx in state.phases.values() {
        *by_state.entry(ctx.state.as_str().to_string()).or_insert(0) += 1;
        *by_type.entry(ctx.phase_type.as_str().to_string()).or_insert(0) += 1;
    }
    (by_state, by_type)
}

fn scan_executions(
    state: &mut CoordinatorState,
    now: DateTime<Utc>,
    warning: EscalationTier,
    critical: EscalationTier,
) -> (Vec<Escalation>, Vec<NestedPhaseExecution>) {
    let mut escalations = Vec::new();
    let mut orphaned = Vec::new();

    for execution in state
        .executions
        .values_mut()
        .filter(|e| e.status == ExecutionStatus::Pending)
    {
        execution.record_health_check(now);
        let elapsed = execution.elapsed_seconds(now);
        let timeout = execution.timeout_seconds as f64;

        if elapsed > timeout {
            let message = format!(
                "Execution orphaned - timed out after {} minutes. Health checks: {}, Progress updates: {}",
                execution.timeout_seconds / 60,
                execution.health_checks.len(),
                execution.progress_updates.len()
            );
            if execution.fail(message, now) {
                execution.orphaned = true;
                orphaned.push(execution.clone());
            }
            continue;
        }

        let percent = if timeout > 0.0 {
            elapsed / timeout * 100.0
        } else {
            100.0
        };
        let idle = execution.idle_seconds(now);
        let severity = if percent > critical.elapsed_percent && idle > critical.idle_secs as f64 {
            Some(HealthStatus::Critical)
        } else if percent > warning.elapsed_percent && idle > warning.idle_secs as f64 {
            Some(HealthStatus::Warning)
        } else {
            None
        };
        if let Some(severity) = severity {
            escalations.push(Escalation {
                execution: execution.clone(),
                severity,
                elapsed_seconds: elapsed,
                idle_seconds: idle,
            });
        }
    }

    (escalations, orphaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::coordinator::CoordinatorSettings;
    use crate::phase::types::{ExecutionPriority, JsonMap, PhaseType};
    use crate::resources::InMemoryResources;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn backdated(id: &str, timeout: u64, started_ago: i64, idle_for: i64, now: DateTime<Utc>) -> NestedPhaseExecution {
        let start = now - ChronoDuration::seconds(started_ago);
        let mut execution =
            NestedPhaseExecution::new(id, "parent", "child", timeout, ExecutionPriority::Normal, start);
        execution.record_progress("initialization", json!({}), start);
        execution.last_activity = now - ChronoDuration::seconds(idle_for);
        execution
    }

    #[tokio::test]
    async fn test_two_tier_escalation_and_orphan() {
        let res = InMemoryResources::new();
        let coord = PhaseCoordinator::new(res.handles());
        let now = Utc::now();

        coord
            .insert_execution_for_test(backdated("healthy", 3600, 600, 60, now))
            .await;
        coord
            .insert_execution_for_test(backdated("slow", 3600, 2000, 1900, now))
            .await;
        coord
            .insert_execution_for_test(backdated("stuck", 3600, 2800, 1000, now))
            .await;
        coord
            .insert_execution_for_test(backdated("gone", 1800, 1900, 1900, now))
            .await;

        let report = coord.run_monitor_cycle(now).await.unwrap();
        assert_eq!(report.warning_executions, vec!["slow"]);
        assert_eq!(report.critical_executions, vec!["stuck"]);
        assert_eq!(report.orphaned_executions, vec!["gone"]);

        let gone = coord.get_nested_execution("gone").await.unwrap();
        assert_eq!(gone.status, ExecutionStatus::Failed);
        assert!(gone.orphaned);
        assert_eq!(
            gone.error.as_deref(),
            Some("Execution orphaned - timed out after 30 minutes. Health checks: 1, Progress updates: 1")
        );
        let healthy = coord.get_nested_execution("healthy").await.unwrap();
        assert_eq!(healthy.health_checks.len(), 1);

        let alerts = res.events.events_of(EventType::ResourceAlertCreated).await;
        let severities: Vec<_> = alerts.iter().map(|e| e.payload["severity"].clone()).collect();
        assert!(severities.contains(&json!("WARNING")));
        assert!(severities.contains(&json!("CRITICAL")));

        let errors = res.events.events_of(EventType::ResourceErrorOccurred).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].priority, EventPriority::High);
        assert_eq!(errors[0].payload["error_type"], "orphaned_execution");

        // 终态不再被巡检触碰
        let second = coord.run_monitor_cycle(now).await.unwrap();
        assert!(second.orphaned_executions.is_empty());
        let gone = coord.get_nested_execution("gone").await.unwrap();
        assert_eq!(gone.health_checks.len(), 1);
    }

    #[tokio::test]
    async fn test_warning_tier_execution_stays_pending() {
        let res = InMemoryResources::new();
        let coord = PhaseCoordinator::new(res.handles());
        let now = Utc::now();

        // 60% elapsed, idle for more than 30 minutes
        coord
            .insert_execution_for_test(backdated("sixty", 3600, 2160, 1900, now))
            .await;

        let report = coord.run_monitor_cycle(now).await.unwrap();
        assert_eq!(report.warning_executions, vec!["sixty"]);
        assert!(report.critical_executions.is_empty());
        assert!(report.orphaned_executions.is_empty());

        let alerts = res.events.events_of(EventType::ResourceAlertCreated).await;
        let alert = alerts
            .iter()
            .find(|e| e.payload["execution_id"] == "sixty")
            .expect("warning alert for sixty");
        assert_eq!(alert.payload["severity"], "WARNING");
        assert_eq!(alert.payload["alert_type"], "nested_execution_stalled");

        let sixty = coord.get_nested_execution("sixty").await.unwrap();
        assert_eq!(sixty.status, ExecutionStatus::Pending);
        assert!(sixty.end_time.is_none());
        assert!(sixty.error.is_none());
        assert!(!sixty.orphaned);
        assert!(res
            .events
            .events_of(EventType::ResourceErrorOccurred)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_stalled_phase_flagged_not_failed() {
        let res = InMemoryResources::new();
        let coord = PhaseCoordinator::new(res.handles());
        coord
            .initialize_phase("long", PhaseType::Three, JsonMap::new(), None, None)
            .await
            .unwrap();
        coord.force_state_for_test("long", PhaseState::Running).await;

        let later = Utc::now() + ChronoDuration::seconds(3700);
        let report = coord.run_monitor_cycle(later).await.unwrap();
        assert_eq!(report.stalled_phases, vec!["long"]);
        assert_eq!(coord.phase_state("long").await, Some(PhaseState::Running));
        assert_eq!(res.metrics.latest("phase_coordinator:stalled_phases").await, Some(1.0));
        assert_eq!(
            res.metrics
                .latest("phase_coordinator:phases_by_state:RUNNING")
                .await,
            Some(1.0)
        );
        assert_eq!(
            res.metrics
                .latest("phase_coordinator:phases_by_type:phase_three")
                .await,
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_monitor_loop_start_stop() {
        let res = InMemoryResources::new();
        let settings = CoordinatorSettings {
            monitor_interval: Duration::from_millis(20),
            ..CoordinatorSettings::default()
        };
        let coord = Arc::new(PhaseCoordinator::new(res.handles()).with_settings(settings));
        coord.start().await.unwrap();
        assert!(coord.is_monitoring().await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        coord.stop().await;
        assert!(!coord.is_monitoring().await);
        assert!(res
            .metrics
            .latest("phase_coordinator:stalled_phases")
            .await
            .is_some());
    }
}
