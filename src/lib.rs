//! FFTT - 阶段协调与错误恢复核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、后台循环句柄、清理回调与关闭信号
//! - **resources**: 事件总线、状态存储、指标、健康追踪等外部协作者接口
//! - **phase**: 阶段生命周期、熔断、嵌套执行、检查点与巡检
//! - **monitoring**: 系统指标历史、告警规则与恢复建议
//! - **recovery**: 错误分类、恢复策略执行与系统级恢复管理
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod monitoring;
pub mod observability;
pub mod phase;
pub mod recovery;
pub mod resources;

pub use phase::{PhaseCoordinator, PhaseType};
pub use recovery::{SystemErrorRecovery, SystemRecoveryManager};
