//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FFTT__*` 覆盖（双下划线表示嵌套，如 `FFTT__COORDINATOR__MONITOR_INTERVAL_SECS=5`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::monitoring::{MonitoringSettings, RuleThresholds};
use crate::phase::{CircuitBreakerConfig, CoordinatorSettings, EscalationTier};
use crate::recovery::{ClassifierThresholds, ManagerSettings, RecoverySettings};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    /// 按熔断器名（phase_one / transition / custom ...）覆盖默认配置
    #[serde(default)]
    pub circuit_breakers: HashMap<String, CircuitBreakerConfig>,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub monitoring: MonitoringSection,
}

/// [app] 段：应用名、日志级别、状态文件
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 默认日志指令，RUST_LOG 优先
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 设置后使用 JSON 文件持久化状态，否则只在内存中
    pub state_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            log_level: default_log_level(),
            state_file: None,
        }
    }
}

/// [coordinator] 段：巡检周期、停滞阈值与升级档位
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorSection {
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_monitor_error_backoff_secs")]
    pub monitor_error_backoff_secs: u64,
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    #[serde(default = "default_warning_elapsed_percent")]
    pub warning_elapsed_percent: f64,
    #[serde(default = "default_warning_idle_secs")]
    pub warning_idle_secs: u64,
    #[serde(default = "default_critical_elapsed_percent")]
    pub critical_elapsed_percent: f64,
    #[serde(default = "default_critical_idle_secs")]
    pub critical_idle_secs: u64,
    #[serde(default = "default_coordinator_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_monitor_interval_secs() -> u64 {
    60
}

fn default_monitor_error_backoff_secs() -> u64 {
    10
}

fn default_stall_threshold_secs() -> u64 {
    3600
}

fn default_warning_elapsed_percent() -> f64 {
    50.0
}

fn default_warning_idle_secs() -> u64 {
    1800
}

fn default_critical_elapsed_percent() -> f64 {
    75.0
}

fn default_critical_idle_secs() -> u64 {
    900
}

fn default_coordinator_stop_timeout_secs() -> u64 {
    5
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval_secs(),
            monitor_error_backoff_secs: default_monitor_error_backoff_secs(),
            stall_threshold_secs: default_stall_threshold_secs(),
            warning_elapsed_percent: default_warning_elapsed_percent(),
            warning_idle_secs: default_warning_idle_secs(),
            critical_elapsed_percent: default_critical_elapsed_percent(),
            critical_idle_secs: default_critical_idle_secs(),
            stop_timeout_secs: default_coordinator_stop_timeout_secs(),
        }
    }
}

impl CoordinatorSection {
    pub fn to_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            monitor_interval: Duration::from_secs(self.monitor_interval_secs.max(1)),
            monitor_error_backoff: Duration::from_secs(self.monitor_error_backoff_secs.max(1)),
            stall_threshold_secs: self.stall_threshold_secs,
            warning_tier: EscalationTier {
                elapsed_percent: self.warning_elapsed_percent,
                idle_secs: self.warning_idle_secs,
            },
            critical_tier: EscalationTier {
                elapsed_percent: self.critical_elapsed_percent,
                idle_secs: self.critical_idle_secs,
            },
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
        }
    }
}

/// [recovery] 段：advisor 超时、分类阈值与恢复管理器巡检
#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_advisor_timeout_secs")]
    pub advisor_timeout_secs: u64,
    #[serde(default = "default_restart_step_timeout_ms")]
    pub restart_step_timeout_ms: u64,
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    #[serde(default = "default_fatal_after")]
    pub fatal_after: u32,
    #[serde(default = "default_forced_cleanup_after")]
    pub forced_cleanup_after: u32,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_max_active_errors")]
    pub max_active_errors: usize,
    #[serde(default = "default_min_recovery_rate")]
    pub min_recovery_rate: f64,
    #[serde(default = "default_min_errors_for_rate_alert")]
    pub min_errors_for_rate_alert: u64,
}

fn default_advisor_timeout_secs() -> u64 {
    5
}

fn default_restart_step_timeout_ms() -> u64 {
    1000
}

fn default_degraded_after() -> u32 {
    2
}

fn default_fatal_after() -> u32 {
    5
}

fn default_forced_cleanup_after() -> u32 {
    3
}

fn default_health_check_interval_secs() -> u64 {
    300
}

fn default_max_active_errors() -> usize {
    10
}

fn default_min_recovery_rate() -> f64 {
    0.5
}

fn default_min_errors_for_rate_alert() -> u64 {
    5
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            advisor_timeout_secs: default_advisor_timeout_secs(),
            restart_step_timeout_ms: default_restart_step_timeout_ms(),
            degraded_after: default_degraded_after(),
            fatal_after: default_fatal_after(),
            forced_cleanup_after: default_forced_cleanup_after(),
            health_check_interval_secs: default_health_check_interval_secs(),
            max_active_errors: default_max_active_errors(),
            min_recovery_rate: default_min_recovery_rate(),
            min_errors_for_rate_alert: default_min_errors_for_rate_alert(),
        }
    }
}

impl RecoverySection {
    pub fn to_settings(&self) -> RecoverySettings {
        RecoverySettings {
            advisor_timeout: Duration::from_secs(self.advisor_timeout_secs),
            restart_step_timeout: Duration::from_millis(self.restart_step_timeout_ms),
            classifier: ClassifierThresholds {
                degraded_after: self.degraded_after,
                fatal_after: self.fatal_after,
                forced_cleanup_after: self.forced_cleanup_after,
            },
        }
    }

    pub fn to_manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            health_check_interval: Duration::from_secs(self.health_check_interval_secs.max(1)),
            max_active_errors: self.max_active_errors,
            min_recovery_rate: self.min_recovery_rate,
            min_errors_for_rate_alert: self.min_errors_for_rate_alert,
            ..ManagerSettings::default()
        }
    }
}

/// [monitoring] 段：监控代理周期与历史窗口
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringSection {
    #[serde(default = "default_monitoring_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_monitoring_error_backoff_secs")]
    pub error_backoff_secs: u64,
    #[serde(default = "default_history_window_hours")]
    pub history_window_hours: i64,
    #[serde(default = "default_recent_reports")]
    pub recent_reports: usize,
    #[serde(default = "default_monitoring_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_monitoring_interval_secs() -> u64 {
    300
}

fn default_monitoring_error_backoff_secs() -> u64 {
    60
}

fn default_history_window_hours() -> i64 {
    24
}

fn default_recent_reports() -> usize {
    10
}

fn default_monitoring_stop_timeout_secs() -> u64 {
    2
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            interval_secs: default_monitoring_interval_secs(),
            error_backoff_secs: default_monitoring_error_backoff_secs(),
            history_window_hours: default_history_window_hours(),
            recent_reports: default_recent_reports(),
            stop_timeout_secs: default_monitoring_stop_timeout_secs(),
        }
    }
}

impl MonitoringSection {
    pub fn to_settings(&self) -> MonitoringSettings {
        MonitoringSettings {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            error_backoff: Duration::from_secs(self.error_backoff_secs.max(1)),
            history_window: chrono::Duration::hours(self.history_window_hours.max(1)),
            recent_reports: self.recent_reports.max(1),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            thresholds: RuleThresholds::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 FFTT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FFTT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FFTT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置；熔断器配置变化需通过 update_circuit_breaker_config 应用到运行中的协调器
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_settings() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.log_level, "info");

        let coordinator = cfg.coordinator.to_settings();
        assert_eq!(coordinator.monitor_interval, Duration::from_secs(60));
        assert_eq!(coordinator.stall_threshold_secs, 3600);
        assert_eq!(coordinator.critical_tier.idle_secs, 900);

        let recovery = cfg.recovery.to_settings();
        assert_eq!(recovery.restart_step_timeout, Duration::from_secs(1));
        assert_eq!(recovery.classifier.fatal_after, 5);

        let monitoring = cfg.monitoring.to_settings();
        assert_eq!(monitoring.interval, Duration::from_secs(300));
        assert_eq!(monitoring.recent_reports, 10);
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[app]
name = "fftt-test"

[coordinator]
monitor_interval_secs = 5

[circuit_breakers.phase_two]
failure_threshold = 2
recovery_timeout_secs = 30
failure_window_secs = 120
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.app.name.as_deref(), Some("fftt-test"));
        assert_eq!(cfg.coordinator.monitor_interval_secs, 5);
        assert_eq!(cfg.coordinator.stall_threshold_secs, 3600);
        let breaker = &cfg.circuit_breakers["phase_two"];
        assert_eq!(breaker.failure_threshold, 2);
        assert_eq!(breaker.half_open_max_tries, 1);
    }
}
