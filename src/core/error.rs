//! 协调层错误类型
//!
//! 与 PhaseCoordinator / PhaseRegistry 配合：生命周期、检查点、嵌套执行的失败都归入 CoordinatorError；
//! 外部协作者（事件总线、状态存储）的失败归入 ResourceError。

use thiserror::Error;

/// 外部协作者（EventBus / StateStore / MetricsSink）调用失败
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Event emission failed: {0}")]
    Event(String),

    #[error("State store error: {0}")]
    State(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// 阶段协调过程中可能出现的错误
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    #[error("Phase already exists: {0}")]
    PhaseExists(String),

    #[error("Invalid phase type: {0}")]
    InvalidPhaseType(String),

    /// 嵌套执行的目标不是父阶段已登记的子阶段（调用方编程错误，不可恢复）
    #[error("Phase {child} is not a child of {parent}")]
    NotAChild { parent: String, child: String },

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Invalid circuit breaker config: {0}")]
    InvalidCircuitConfig(String),

    #[error("Custom phase type {0} is still in use")]
    PhaseTypeInUse(String),

    /// 子阶段失败且没有任何 on_failure 处理器给出恢复结果
    #[error("Nested execution {execution_id} failed: {message}")]
    NestedExecutionFailed {
        execution_id: String,
        error_type: String,
        message: String,
    },

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 阶段执行失败：携带错误类型名，便于写入 error_info 与恢复处理器
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{error_type}: {message}")]
pub struct PhaseFailure {
    pub error_type: String,
    pub message: String,
}

impl PhaseFailure {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

impl From<CoordinatorError> for PhaseFailure {
    fn from(err: CoordinatorError) -> Self {
        let error_type = match &err {
            CoordinatorError::UnknownPhase(_) => "UnknownPhase",
            CoordinatorError::NestedExecutionFailed { error_type, .. } => error_type.as_str(),
            CoordinatorError::Resource(_) => "ResourceError",
            _ => "CoordinatorError",
        };
        PhaseFailure::new(error_type, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_failure_display() {
        let failure = PhaseFailure::new("ValueError", "bad input");
        assert_eq!(failure.to_string(), "ValueError: bad input");
    }

    #[test]
    fn test_nested_failure_keeps_error_type() {
        let err = CoordinatorError::NestedExecutionFailed {
            execution_id: "p1_to_p2".into(),
            error_type: "TimeoutError".into(),
            message: "child timed out".into(),
        };
        let failure = PhaseFailure::from(err);
        assert_eq!(failure.error_type, "TimeoutError");
        assert!(failure.message.contains("p1_to_p2"));
    }
}
