//! 错误恢复
//!
//! - `types`：严重度、恢复策略、OperationError、分类与建议
//! - `classifier`：错误分类器
//! - `strategy`：固定策略集合的执行
//! - `system`：SystemErrorRecovery 主流程
//! - `manager`：与 PhaseCoordinator 集成的 SystemRecoveryManager

pub mod classifier;
pub mod manager;
pub mod strategy;
pub mod system;
pub mod types;

pub use classifier::{ClassifierThresholds, CountingClassifier, ErrorClassifier};
pub use manager::{
    ActiveError, ManagerSettings, RecoveryCounters, RecoveryHook, RecoveryMetrics,
    SystemCheckpoint, SystemRecoveryManager, SYSTEM_CHECKPOINT_KEY_PREFIX,
};
pub use strategy::StrategyExecutor;
pub use system::{RecoveryAdvisor, RecoverySettings, SystemErrorRecovery};
pub use types::{
    DecisionContext, ErrorClassification, ErrorContext, ErrorSeverity, OperationError,
    RecoveryRecommendation, RecoveryStrategy,
};
