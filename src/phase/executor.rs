//! 阶段执行器
//!
//! 协调器只负责状态机与保护，真正的阶段工作由执行器完成（各阶段编排器实现此 trait）。

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use super::types::{JsonMap, PhaseContext};
use crate::core::PhaseFailure;

#[async_trait::async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// 执行阶段；返回的 map 作为 PhaseContext.result
    async fn execute(&self, context: &PhaseContext, input: JsonMap) -> Result<JsonMap, PhaseFailure>;
}

/// 模拟执行器：短暂等待后回显输入
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    delay: Duration,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(10),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PhaseExecutor for SimulatedExecutor {
    async fn execute(&self, context: &PhaseContext, input: JsonMap) -> Result<JsonMap, PhaseFailure> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut output = JsonMap::new();
        output.insert("phase_id".into(), json!(context.phase_id));
        output.insert("phase_type".into(), json!(context.phase_type.as_str()));
        output.insert("input_keys".into(), json!(input.keys().collect::<Vec<_>>()));
        output.insert("completed_at".into(), json!(Utc::now().to_rfc3339()));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::types::PhaseType;

    #[tokio::test]
    async fn test_simulated_executor_echoes_input() {
        let executor = SimulatedExecutor::new().with_delay(Duration::ZERO);
        let ctx = PhaseContext::new("p1", PhaseType::One.into());
        let mut input = JsonMap::new();
        input.insert("spec".into(), json!("build it"));
        let out = executor.execute(&ctx, input).await.unwrap();
        assert_eq!(out["phase_type"], "phase_one");
        assert_eq!(out["input_keys"], json!(["spec"]));
    }
}
