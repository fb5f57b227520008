//! 阶段协调
//!
//! - `types`：阶段类型、状态、上下文、嵌套执行与检查点数据
//! - `circuit`：按阶段类型隔离的熔断器
//! - `registry`：内置 / 自定义阶段类型与熔断器注册表
//! - `handlers`：迁移钩子与按名称解析的处理器注册表
//! - `executor`：阶段实际工作的执行接口
//! - `coordinator` 及 `nested` / `checkpoint` / `monitor` / `status`：PhaseCoordinator

pub mod checkpoint;
pub mod circuit;
pub mod coordinator;
pub mod executor;
pub mod handlers;
pub mod monitor;
pub mod nested;
pub mod registry;
pub mod status;
pub mod types;

pub use checkpoint::CHECKPOINT_KEY_PREFIX;
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState};
pub use coordinator::{
    CoordinatorSettings, EscalationTier, PhaseCoordinator, PhaseTypeCatalog, PhaseTypeEntry,
    CIRCUIT_CONFIG_KEY,
};
pub use executor::{PhaseExecutor, SimulatedExecutor};
pub use handlers::{HandlerFactory, HandlerRegistry, LoggingHandler, PhaseTransitionHandler};
pub use monitor::MonitorCycleReport;
pub use nested::NestedExecutionOptions;
pub use registry::{CustomPhaseType, PhaseRegistry, CUSTOM_PHASE_PREFIX, TRANSITION_CIRCUIT};
pub use status::{
    ActivePhaseInfo, ChildStatus, CurrentPhaseInfo, NestedExecutionSummary, PhaseHealthReport,
    PhaseProgress, PhaseStatusReport,
};
pub use types::{
    Checkpoint, ExecutionCheckpoints, ExecutionMetadata, ExecutionPriority, ExecutionStatus,
    JsonMap, NestedPhaseExecution, PhaseContext, PhaseErrorInfo, PhaseKind, PhaseRunResult,
    PhaseState, PhaseType, ProgressUpdate, RunStatus,
};
