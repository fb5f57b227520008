//! 指标规则：四棵固定决策树
//!
//! 纯函数，只读取 `MetricsHistory`，`now` 由调用方传入。
//! 每棵树给出一个 `FlagEvaluation`，任一条件命中即升旗。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::metrics::{MetricsHistory, SystemMetrics};
use crate::resources::HealthStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagType {
    DevBlocked,
    ResourceCritical,
    ErrorSurge,
    ComponentFailure,
}

impl FlagType {
    pub const ALL: [FlagType; 4] = [
        FlagType::DevBlocked,
        FlagType::ResourceCritical,
        FlagType::ErrorSurge,
        FlagType::ComponentFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlagType::DevBlocked => "DEV_BLOCKED",
            FlagType::ResourceCritical => "RESOURCE_CRITICAL",
            FlagType::ErrorSurge => "ERROR_SURGE",
            FlagType::ComponentFailure => "COMPONENT_FAILURE",
        }
    }
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一棵决策树的评估结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagEvaluation {
    pub flag_raised: bool,
    pub flag_type: FlagType,
    pub affected_components: Vec<String>,
    pub metrics_snapshot: Value,
    pub primary_triggers: Vec<String>,
    pub contributing_factors: Vec<String>,
}

/// 规则阈值
#[derive(Debug, Clone)]
pub struct RuleThresholds {
    pub holding_duration: ChronoDuration,
    pub dev_stall_duration: ChronoDuration,

    pub critical_usage_percent: f64,
    pub critical_consecutive_samples: usize,
    pub rolling_average_percent: f64,
    pub rolling_window: ChronoDuration,
    pub rolling_min_samples: usize,
    pub consumption_increase: f64,
    pub consumption_sustain: ChronoDuration,
    pub consumption_baseline: ChronoDuration,

    pub error_rate: f64,
    pub error_rate_window: ChronoDuration,
    pub critical_error_rate: f64,
    pub critical_error_window: ChronoDuration,
    pub baseline_multiplier: f64,
    pub dependent_multiplier: f64,
    pub dependent_count: usize,

    pub spike_factor: f64,
    pub repeated_failures: u32,
    pub repeated_failures_window: ChronoDuration,
    pub missed_cycles: usize,
    pub correlated_failures: usize,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            holding_duration: ChronoDuration::minutes(30),
            dev_stall_duration: ChronoDuration::hours(1),

            critical_usage_percent: 90.0,
            critical_consecutive_samples: 3,
            rolling_average_percent: 85.0,
            rolling_window: ChronoDuration::minutes(15),
            rolling_min_samples: 3,
            consumption_increase: 0.5,
            consumption_sustain: ChronoDuration::minutes(3),
            consumption_baseline: ChronoDuration::hours(1),

            error_rate: 0.10,
            error_rate_window: ChronoDuration::minutes(5),
            critical_error_rate: 0.25,
            critical_error_window: ChronoDuration::minutes(3),
            baseline_multiplier: 3.0,
            dependent_multiplier: 5.0,
            dependent_count: 3,

            spike_factor: 1.5,
            repeated_failures: 3,
            repeated_failures_window: ChronoDuration::minutes(15),
            missed_cycles: 2,
            correlated_failures: 2,
        }
    }
}

/// 依次评估四棵树
pub fn evaluate_all(history: &MetricsHistory, now: DateTime<Utc>, t: &RuleThresholds) -> Vec<FlagEvaluation> {
    vec![
        evaluate_dev_blocked(history, now, t),
        evaluate_resource_critical(history, now, t),
        evaluate_error_surge(history, now, t),
        evaluate_component_failure(history, now, t),
    ]
}

/// 收集触发条件；第一条为主触发，其余为附加因素
#[derive(Default)]
struct Findings {
    triggers: Vec<String>,
    components: BTreeSet<String>,
    snapshot: serde_json::Map<String, Value>,
}

impl Findings {
    fn hit(&mut self, trigger: String, components: impl IntoIterator<Item = String>) {
        self.triggers.push(trigger);
        self.components.extend(components);
    }

    fn finish(self, flag_type: FlagType) -> FlagEvaluation {
        let flag_raised = !self.triggers.is_empty();
        let mut triggers = self.triggers.into_iter();
        let primary_triggers = triggers.next().into_iter().collect();
        FlagEvaluation {
            flag_raised,
            flag_type,
            affected_components: self.components.into_iter().collect(),
            metrics_snapshot: Value::Object(self.snapshot),
            primary_triggers,
            contributing_factors: triggers.collect(),
        }
    }
}

pub fn evaluate_dev_blocked(history: &MetricsHistory, now: DateTime<Utc>, t: &RuleThresholds) -> FlagEvaluation {
    let mut findings = Findings::default();
    let branches: Vec<String> = history
        .latest()
        .and_then(|m| m.development.as_ref())
        .map(|d| d.branches.keys().cloned().collect())
        .unwrap_or_default();

    if history.held_for(now, t.holding_duration, |m| {
        m.development.as_ref().map_or(false, |d| d.all_branches_holding())
    }) {
        findings.hit(
            format!(
                "All development branches HOLDING for more than {} minutes",
                t.holding_duration.num_minutes()
            ),
            branches.clone(),
        );
    }
    if history.held_for(now, t.dev_stall_duration, |m| {
        m.development.as_ref().map_or(false, |d| d.metric_aggregates == 0)
    }) {
        findings.hit(
            format!(
                "No development metric aggregates for more than {} minutes",
                t.dev_stall_duration.num_minutes()
            ),
            Vec::new(),
        );
    }
    if history.held_for(now, t.dev_stall_duration, |m| {
        m.development
            .as_ref()
            .map_or(false, |d| d.completed_critical_transitions == 0)
    }) {
        findings.hit(
            format!(
                "No completed critical-path transitions for more than {} minutes",
                t.dev_stall_duration.num_minutes()
            ),
            Vec::new(),
        );
    }

    if let Some(dev) = history.latest().and_then(|m| m.development.as_ref()) {
        findings.snapshot.insert("branches".into(), json!(dev.branches));
        findings
            .snapshot
            .insert("metric_aggregates".into(), json!(dev.metric_aggregates));
        findings.snapshot.insert(
            "completed_critical_transitions".into(),
            json!(dev.completed_critical_transitions),
        );
    }
    findings.finish(FlagType::DevBlocked)
}

fn usage_of(metrics: &SystemMetrics, source: &str) -> Option<f64> {
    metrics.resource_usage.get(source).map(|u| u.usage_percent)
}

fn average(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

pub fn evaluate_resource_critical(
    history: &MetricsHistory,
    now: DateTime<Utc>,
    t: &RuleThresholds,
) -> FlagEvaluation {
    let mut findings = Findings::default();
    let Some(latest) = history.latest() else {
        return findings.finish(FlagType::ResourceCritical);
    };

    let critical_sources: Vec<&String> = latest
        .resource_usage
        .iter()
        .filter(|(_, u)| u.critical)
        .map(|(name, _)| name)
        .collect();

    for source in critical_sources {
        let last = history.last_n(t.critical_consecutive_samples);
        if last.len() == t.critical_consecutive_samples
            && last
                .iter()
                .all(|m| usage_of(m, source).map_or(false, |u| u > t.critical_usage_percent))
        {
            findings.hit(
                format!(
                    "{source} above {}% for {} consecutive samples",
                    t.critical_usage_percent, t.critical_consecutive_samples
                ),
                [source.clone()],
            );
        }

        let window: Vec<f64> = history
            .between(now - t.rolling_window, now)
            .into_iter()
            .filter_map(|m| usage_of(m, source))
            .collect();
        if window.len() >= t.rolling_min_samples {
            if let Some(avg) = average(&window).filter(|avg| *avg > t.rolling_average_percent) {
                findings.hit(
                    format!(
                        "{source} rolling average {avg:.1}% over {} minutes",
                        t.rolling_window.num_minutes()
                    ),
                    [source.clone()],
                );
            }
        }

        let sustain_start = now - t.consumption_sustain;
        let baseline: Vec<f64> = history
            .between(sustain_start - t.consumption_baseline, sustain_start)
            .into_iter()
            .filter(|m| m.timestamp < sustain_start)
            .filter_map(|m| usage_of(m, source))
            .collect();
        if let Some(base) = average(&baseline).filter(|b| *b > 0.0) {
            let limit = base * (1.0 + t.consumption_increase);
            if history.held_for(now, t.consumption_sustain, |m| {
                usage_of(m, source).map_or(false, |u| u > limit)
            }) {
                findings.hit(
                    format!(
                        "{source} consumption up more than {:.0}% over prior-hour baseline {base:.1}%",
                        t.consumption_increase * 100.0
                    ),
                    [source.clone()],
                );
            }
        }

        findings
            .snapshot
            .insert(source.clone(), json!(usage_of(latest, source)));
    }
    findings.finish(FlagType::ResourceCritical)
}

/// 一组快照上的汇总错误率
fn pooled_rate<'a, I>(snapshots: I, component: Option<&str>) -> Option<f64>
where
    I: IntoIterator<Item = &'a SystemMetrics>,
{
    let (errors, requests) = snapshots
        .into_iter()
        .flat_map(|m| {
            m.error_counts
                .iter()
                .filter(|(name, _)| component.map_or(true, |c| c == name.as_str()))
                .map(|(_, c)| (c.errors, c.requests))
        })
        .fold((0u64, 0u64), |(e, r), (ce, cr)| (e + ce, r + cr));
    (requests > 0).then(|| errors as f64 / requests as f64)
}

pub fn evaluate_error_surge(history: &MetricsHistory, now: DateTime<Utc>, t: &RuleThresholds) -> FlagEvaluation {
    let mut findings = Findings::default();
    let Some(latest) = history.latest() else {
        return findings.finish(FlagType::ErrorSurge);
    };

    let recent = history.between(now - t.error_rate_window, now);
    let recent_rate = pooled_rate(recent.iter().copied(), None);
    let all_components: Vec<String> = latest.error_counts.keys().cloned().collect();
    if let Some(rate) = recent_rate.filter(|r| *r > t.error_rate) {
        findings.hit(
            format!(
                "Error rate {:.1}% over {} minutes",
                rate * 100.0,
                t.error_rate_window.num_minutes()
            ),
            all_components.clone(),
        );
    }

    let critical_window = history.between(now - t.critical_error_window, now);
    for (component, counts) in &latest.error_counts {
        if !counts.critical {
            continue;
        }
        if let Some(rate) = pooled_rate(critical_window.iter().copied(), Some(component))
            .filter(|r| *r > t.critical_error_rate)
        {
            findings.hit(
                format!(
                    "Critical component {component} error rate {:.1}% over {} minutes",
                    rate * 100.0,
                    t.critical_error_window.num_minutes()
                ),
                [component.clone()],
            );
        }
    }

    let recent_start = now - t.error_rate_window;
    let baseline_rate = pooled_rate(history.iter().filter(|m| m.timestamp < recent_start), None);
    if let (Some(rate), Some(base)) = (recent_rate, baseline_rate.filter(|b| *b > 0.0)) {
        if rate > base * t.baseline_multiplier {
            findings.hit(
                format!(
                    "Error rate {:.1}% exceeds {}x the 24h baseline {:.1}%",
                    rate * 100.0,
                    t.baseline_multiplier,
                    base * 100.0
                ),
                all_components.clone(),
            );
        }
    }

    let earlier: Vec<&SystemMetrics> = history
        .iter()
        .filter(|m| m.timestamp < latest.timestamp)
        .collect();
    let surging: Vec<String> = latest
        .error_counts
        .iter()
        .filter_map(|(component, counts)| {
            let current = counts.rate()?;
            let base = pooled_rate(earlier.iter().copied(), Some(component)).filter(|b| *b > 0.0)?;
            (current > base * t.dependent_multiplier).then(|| component.clone())
        })
        .collect();
    if surging.len() >= t.dependent_count {
        findings.hit(
            format!(
                "{} dependent components above {}x their baseline error rate",
                surging.len(),
                t.dependent_multiplier
            ),
            surging,
        );
    }

    findings.snapshot.insert("error_rate".into(), json!(recent_rate));
    findings
        .snapshot
        .insert("baseline_error_rate".into(), json!(baseline_rate));
    findings.finish(FlagType::ErrorSurge)
}

pub fn evaluate_component_failure(
    history: &MetricsHistory,
    now: DateTime<Utc>,
    t: &RuleThresholds,
) -> FlagEvaluation {
    let mut findings = Findings::default();
    let Some(latest) = history.latest() else {
        return findings.finish(FlagType::ComponentFailure);
    };
    let previous = history.previous();

    for (component, status) in &latest.component_health {
        let was_failing = previous
            .and_then(|p| p.component_health.get(component))
            .map_or(false, HealthStatus::is_failing);
        if status.is_failing() && !was_failing {
            findings.hit(
                format!("{component} transitioned to {status}"),
                [component.clone()],
            );
        }
    }

    let last_three = history.last_n(3);
    if last_three.len() == 3 {
        for source in latest.resource_usage.keys() {
            let series: Vec<Option<f64>> = last_three.iter().map(|m| usage_of(m, source)).collect();
            if let &[Some(before), Some(spike), Some(after)] = series.as_slice() {
                if spike > 0.0 && spike >= before * t.spike_factor && after == 0.0 {
                    findings.hit(
                        format!("{source} usage spiked to {spike:.1}% then dropped to zero"),
                        [source.clone()],
                    );
                }
            }
        }
    }

    let mut failure_counts: BTreeMap<&str, u32> = BTreeMap::new();
    for m in history.between(now - t.repeated_failures_window, now) {
        for (component, count) in &m.resource_failed {
            *failure_counts.entry(component.as_str()).or_insert(0) += count;
        }
    }
    for (component, count) in failure_counts {
        if count >= t.repeated_failures {
            findings.hit(
                format!("{component} reported {count} resource_failed events"),
                [component.to_string()],
            );
        }
    }

    let recent = history.last_n(t.missed_cycles + 1);
    if history.len() > recent.len() {
        let recently_seen: BTreeSet<&str> = recent
            .iter()
            .flat_map(|m| m.reporting_components())
            .collect();
        let earlier_seen: BTreeSet<&str> = history
            .iter()
            .take(history.len() - recent.len())
            .flat_map(|m| m.reporting_components())
            .collect();
        for component in earlier_seen.difference(&recently_seen) {
            findings.hit(
                format!(
                    "{component} missed metrics for more than {} cycles",
                    t.missed_cycles
                ),
                [component.to_string()],
            );
        }
    }

    let failing = |c: &str| {
        latest
            .component_health
            .get(c)
            .map_or(false, HealthStatus::is_failing)
    };
    for (subsystem, members) in &latest.subsystems {
        let down: Vec<String> = members.iter().filter(|m| failing(m.as_str())).cloned().collect();
        if down.len() >= t.correlated_failures {
            findings.hit(
                format!("Correlated failures in subsystem {subsystem}: {}", down.join(", ")),
                down,
            );
        }
    }

    let degraded = |c: &str| {
        latest
            .component_health
            .get(c)
            .map_or(false, |s| *s >= HealthStatus::Degraded)
    };
    for (primary, backup) in &latest.backups {
        if degraded(primary.as_str()) && degraded(backup.as_str()) {
            findings.hit(
                format!("Primary {primary} and backup {backup} both degraded"),
                [primary.clone(), backup.clone()],
            );
        }
    }

    findings.snapshot.insert(
        "component_health".into(),
        json!(latest.component_health),
    );
    findings.finish(FlagType::ComponentFailure)
}
