//! 阶段数据模型：类型、状态、上下文、嵌套执行记录、检查点、执行结果

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type JsonMap = Map<String, Value>;

/// 内置阶段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PhaseType {
    #[serde(rename = "phase_zero")]
    Zero,
    #[serde(rename = "phase_one")]
    One,
    #[serde(rename = "phase_two")]
    Two,
    #[serde(rename = "phase_three")]
    Three,
    #[serde(rename = "phase_four")]
    Four,
}

impl PhaseType {
    pub const ALL: [PhaseType; 5] = [
        PhaseType::Zero,
        PhaseType::One,
        PhaseType::Two,
        PhaseType::Three,
        PhaseType::Four,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseType::Zero => "phase_zero",
            PhaseType::One => "phase_one",
            PhaseType::Two => "phase_two",
            PhaseType::Three => "phase_three",
            PhaseType::Four => "phase_four",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PhaseType::Zero => "System monitoring and analysis",
            PhaseType::One => "Requirements and component architecture",
            PhaseType::Two => "Component development and testing",
            PhaseType::Three => "Feature development and integration",
            PhaseType::Four => "Code generation and refinement",
        }
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhaseType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("not a built-in phase type: {s}"))
    }
}

/// 阶段类型：内置或运行时注册的自定义类型
///
/// 序列化为单个字符串；自定义 id 不允许与内置名冲突，因此反序列化无歧义。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PhaseKind {
    BuiltIn(PhaseType),
    Custom(String),
}

impl PhaseKind {
    pub fn custom(id: impl Into<String>) -> Self {
        PhaseKind::Custom(id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            PhaseKind::BuiltIn(t) => t.as_str(),
            PhaseKind::Custom(id) => id,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, PhaseKind::Custom(_))
    }

    pub fn built_in(&self) -> Option<PhaseType> {
        match self {
            PhaseKind::BuiltIn(t) => Some(*t),
            PhaseKind::Custom(_) => None,
        }
    }

    /// 嵌套执行的默认超时（秒）
    pub fn default_nested_timeout(&self) -> u64 {
        match self {
            PhaseKind::BuiltIn(PhaseType::Four) => 7200,
            PhaseKind::BuiltIn(PhaseType::Three) => 5400,
            PhaseKind::BuiltIn(PhaseType::Two) => 3600,
            _ => 1800,
        }
    }
}

impl From<PhaseType> for PhaseKind {
    fn from(t: PhaseType) -> Self {
        PhaseKind::BuiltIn(t)
    }
}

impl From<String> for PhaseKind {
    fn from(s: String) -> Self {
        match s.parse::<PhaseType>() {
            Ok(t) => PhaseKind::BuiltIn(t),
            Err(_) => PhaseKind::Custom(s),
        }
    }
}

impl From<&str> for PhaseKind {
    fn from(s: &str) -> Self {
        PhaseKind::from(s.to_string())
    }
}

impl From<PhaseKind> for String {
    fn from(kind: PhaseKind) -> Self {
        match kind {
            PhaseKind::BuiltIn(t) => t.as_str().to_string(),
            PhaseKind::Custom(id) => id,
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    Initializing,
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl PhaseState {
    pub const ALL: [PhaseState; 7] = [
        PhaseState::Initializing,
        PhaseState::Ready,
        PhaseState::Running,
        PhaseState::Paused,
        PhaseState::Completed,
        PhaseState::Failed,
        PhaseState::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseState::Initializing => "INITIALIZING",
            PhaseState::Ready => "READY",
            PhaseState::Running => "RUNNING",
            PhaseState::Paused => "PAUSED",
            PhaseState::Completed => "COMPLETED",
            PhaseState::Failed => "FAILED",
            PhaseState::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseState::Completed | PhaseState::Failed | PhaseState::Aborted
        )
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段失败信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseErrorInfo {
    pub error: String,
    pub error_type: String,
    pub timestamp: DateTime<Utc>,
}

/// 单个阶段实例的上下文
///
/// 只由协调器的状态迁移方法修改；终态上下文保留以供查询。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseContext {
    pub phase_id: String,
    pub phase_type: PhaseKind,
    pub state: PhaseState,
    /// 仅用于查找的父引用
    pub parent_phase_id: Option<String>,
    #[serde(default)]
    pub child_phases: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub config: JsonMap,
    #[serde(default)]
    pub metrics: JsonMap,
    #[serde(default)]
    pub checkpoint_ids: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_info: Option<PhaseErrorInfo>,
    pub result: Option<JsonMap>,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl PhaseContext {
    pub fn new(phase_id: impl Into<String>, phase_type: PhaseKind) -> Self {
        Self {
            phase_id: phase_id.into(),
            phase_type,
            state: PhaseState::Initializing,
            parent_phase_id: None,
            child_phases: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            config: JsonMap::new(),
            metrics: JsonMap::new(),
            checkpoint_ids: Vec::new(),
            start_time: None,
            end_time: None,
            error_info: None,
            result: None,
            metadata: JsonMap::new(),
        }
    }

    pub fn is_custom_type(&self) -> bool {
        self.phase_type.is_custom()
    }

    /// 迁移到新状态，维护「end_time 当且仅当终态」
    ///
    /// 返回迁移前的状态。
    pub fn transition(&mut self, state: PhaseState, now: DateTime<Utc>) -> PhaseState {
        let previous = self.state;
        self.state = state;
        if state.is_terminal() {
            self.end_time = Some(now);
        } else {
            self.end_time = None;
        }
        if state == PhaseState::Running && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        previous
    }

    /// 从开始到结束（或到 now）的秒数
    pub fn running_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or(now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// 嵌套执行状态；终态一经设置不再改变
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Completed,
    Failed,
    Recovered,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// 进度更新记录（有序、只追加）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

/// 嵌套执行关联的检查点
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCheckpoints {
    pub before: Option<String>,
    pub after: Option<String>,
}

/// 一次父→子协调尝试
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NestedPhaseExecution {
    pub execution_id: String,
    pub parent_id: String,
    pub child_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub result: Option<JsonMap>,
    pub error: Option<String>,
    pub timeout_seconds: u64,
    pub priority: ExecutionPriority,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(default)]
    pub health_checks: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub progress_updates: Vec<ProgressUpdate>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub checkpoints: ExecutionCheckpoints,
    /// 被巡检判定为孤儿（超时未完成）
    #[serde(default)]
    pub orphaned: bool,
}

impl NestedPhaseExecution {
    pub fn new(
        execution_id: impl Into<String>,
        parent_id: impl Into<String>,
        child_id: impl Into<String>,
        timeout_seconds: u64,
        priority: ExecutionPriority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            parent_id: parent_id.into(),
            child_id: child_id.into(),
            start_time: now,
            end_time: None,
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            timeout_seconds,
            priority,
            metadata: JsonMap::new(),
            health_checks: Vec::new(),
            progress_updates: Vec::new(),
            last_activity: now,
            checkpoints: ExecutionCheckpoints::default(),
            orphaned: false,
        }
    }

    /// 记录进度并刷新 last_activity
    pub fn record_progress(&mut self, name: impl Into<String>, details: Value, now: DateTime<Utc>) {
        self.progress_updates.push(ProgressUpdate {
            name: name.into(),
            timestamp: now,
            details,
        });
        self.last_activity = now;
    }

    pub fn record_health_check(&mut self, now: DateTime<Utc>) {
        self.health_checks.push(now);
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.start_time).num_milliseconds() as f64 / 1000.0
    }

    pub fn idle_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_activity).num_milliseconds() as f64 / 1000.0
    }

    pub fn has_progress(&self, name: &str) -> bool {
        self.progress_updates.iter().any(|p| p.name == name)
    }

    /// 设置终态；已是终态时返回 false 且不做修改
    fn finish(
        &mut self,
        status: ExecutionStatus,
        result: Option<JsonMap>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() {
            tracing::warn!(
                "Execution {} already {:?}, ignoring transition to {:?}",
                self.execution_id,
                self.status,
                status
            );
            return false;
        }
        self.status = status;
        self.result = result;
        self.error = error;
        self.end_time = Some(now);
        true
    }

    pub fn complete(&mut self, result: JsonMap, now: DateTime<Utc>) -> bool {
        self.finish(ExecutionStatus::Completed, Some(result), None, now)
    }

    pub fn recover(&mut self, result: JsonMap, now: DateTime<Utc>) -> bool {
        self.finish(ExecutionStatus::Recovered, Some(result), None, now)
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        self.finish(ExecutionStatus::Failed, None, Some(error.into()), now)
    }
}

/// 阶段检查点：不可变快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub phase_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: JsonMap,
    pub context: PhaseContext,
}

/// start_phase / coordinate_nested_execution 的结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// 子阶段失败后由 on_failure 处理器恢复
    Recovered,
    Error,
    /// 依赖未完成，软失败，调用方可稍后重试
    DependencyError,
    /// 熔断打开，未尝试执行
    CircuitOpen,
    NotFound,
}

/// 嵌套执行附加到结果上的元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub execution_id: String,
    pub checkpoints: ExecutionCheckpoints,
    #[serde(default)]
    pub recovered: bool,
}

/// 结构化的阶段执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRunResult {
    pub status: RunStatus,
    pub phase_id: String,
    pub phase_type: Option<String>,
    #[serde(default)]
    pub output: JsonMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unfulfilled_dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_metadata: Option<ExecutionMetadata>,
}

impl PhaseRunResult {
    fn base(status: RunStatus, phase_id: &str, phase_type: Option<&PhaseKind>) -> Self {
        Self {
            status,
            phase_id: phase_id.to_string(),
            phase_type: phase_type.map(|k| k.as_str().to_string()),
            output: JsonMap::new(),
            error: None,
            error_type: None,
            unfulfilled_dependencies: Vec::new(),
            execution_metadata: None,
        }
    }

    pub fn success(phase_id: &str, phase_type: &PhaseKind, output: JsonMap) -> Self {
        let mut result = Self::base(RunStatus::Success, phase_id, Some(phase_type));
        result.output = output;
        result
    }

    pub fn error(
        phase_id: &str,
        phase_type: Option<&PhaseKind>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut result = Self::base(RunStatus::Error, phase_id, phase_type);
        result.error_type = Some(error_type.into());
        result.error = Some(message.into());
        result
    }

    pub fn dependency_error(phase_id: &str, phase_type: &PhaseKind, unfulfilled: Vec<String>) -> Self {
        let mut result = Self::base(RunStatus::DependencyError, phase_id, Some(phase_type));
        result.error = Some(format!("Unfulfilled dependencies: {}", unfulfilled.join(", ")));
        result.unfulfilled_dependencies = unfulfilled;
        result
    }

    pub fn circuit_open(phase_id: &str, phase_type: Option<&PhaseKind>, circuit: &str) -> Self {
        let mut result = Self::base(RunStatus::CircuitOpen, phase_id, phase_type);
        result.error = Some(format!("Circuit breaker {circuit} is open"));
        result
    }

    pub fn not_found(phase_id: &str) -> Self {
        let mut result = Self::base(RunStatus::NotFound, phase_id, None);
        result.error = Some(format!("Phase {phase_id} not found"));
        result
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Success | RunStatus::Recovered)
    }
}
