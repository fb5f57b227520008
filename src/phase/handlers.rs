//! 阶段迁移处理器
//!
//! 处理器在阶段初始化时按 config 中的 `transition_handlers` 名称解析：
//! 名称 → 构造函数的静态注册表，替代运行时按类路径加载。
//! 所有钩子都是尽力而为：出错只记录日志，不中断迁移。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use super::types::{JsonMap, PhaseRunResult};
use crate::core::PhaseFailure;

/// 迁移钩子；默认实现均为透传 / 空操作
#[async_trait::async_trait]
pub trait PhaseTransitionHandler: Send + Sync {
    fn name(&self) -> &str;

    /// 子阶段启动前，可改写输入
    async fn before_start(&self, _phase_id: &str, input: JsonMap) -> anyhow::Result<JsonMap> {
        Ok(input)
    }

    /// 子阶段完成后，可改写结果（按注册逆序调用）
    async fn after_completion(
        &self,
        _phase_id: &str,
        result: PhaseRunResult,
    ) -> anyhow::Result<PhaseRunResult> {
        Ok(result)
    }

    /// 子阶段失败时尝试恢复；返回 Some 表示恢复成功，后续处理器不再调用
    async fn on_failure(
        &self,
        _phase_id: &str,
        _error: &PhaseFailure,
        _context: &JsonMap,
    ) -> anyhow::Result<Option<JsonMap>> {
        Ok(None)
    }

    async fn on_pause(&self, _phase_id: &str, _reason: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_resume(&self, _phase_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 处理器构造函数：接收该处理器在 phase config 中的配置
pub type HandlerFactory =
    Arc<dyn Fn(&JsonMap) -> Arc<dyn PhaseTransitionHandler> + Send + Sync>;

/// 处理器名称 → 构造函数
pub struct HandlerRegistry {
    factories: RwLock<HashMap<String, HandlerFactory>>,
}

impl HandlerRegistry {
    /// 空注册表
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// 预置内置处理器（logging）
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.factories.get_mut().insert(
            LoggingHandler::NAME.to_string(),
            Arc::new(|_config: &JsonMap| Arc::new(LoggingHandler) as Arc<dyn PhaseTransitionHandler>),
        );
        registry
    }

    pub async fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&JsonMap) -> Arc<dyn PhaseTransitionHandler> + Send + Sync + 'static,
    {
        let name = name.into();
        if self
            .factories
            .write()
            .await
            .insert(name.clone(), Arc::new(factory))
            .is_some()
        {
            tracing::warn!("Transition handler '{}' re-registered", name);
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.factories.read().await.contains_key(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按 phase config 构造处理器列表
    ///
    /// `transition_handlers` 可以是名称数组，或 `{ "name": ..., "config": {...} }` 对象数组；未知名称跳过。
    pub async fn build_from_config(&self, config: &JsonMap) -> Vec<Arc<dyn PhaseTransitionHandler>> {
        let Some(Value::Array(specs)) = config.get("transition_handlers") else {
            return Vec::new();
        };

        let factories = self.factories.read().await;
        let mut handlers = Vec::new();
        for spec in specs {
            let (name, handler_config) = match spec {
                Value::String(name) => (name.as_str(), JsonMap::new()),
                Value::Object(obj) => match obj.get("name").and_then(Value::as_str) {
                    Some(name) => (
                        name,
                        obj.get("config")
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default(),
                    ),
                    None => {
                        tracing::warn!("Transition handler spec without name: {}", spec);
                        continue;
                    }
                },
                other => {
                    tracing::warn!("Invalid transition handler spec: {}", other);
                    continue;
                }
            };
            match factories.get(name) {
                Some(factory) => handlers.push(factory(&handler_config)),
                None => tracing::warn!("Unknown transition handler '{}', skipping", name),
            }
        }
        handlers
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 内置处理器：记录每次迁移
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl LoggingHandler {
    pub const NAME: &'static str = "logging";
}

#[async_trait::async_trait]
impl PhaseTransitionHandler for LoggingHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn before_start(&self, phase_id: &str, input: JsonMap) -> anyhow::Result<JsonMap> {
        tracing::info!("Phase {} starting with {} input keys", phase_id, input.len());
        Ok(input)
    }

    async fn after_completion(
        &self,
        phase_id: &str,
        result: PhaseRunResult,
    ) -> anyhow::Result<PhaseRunResult> {
        tracing::info!("Phase {} finished with status {:?}", phase_id, result.status);
        Ok(result)
    }

    async fn on_failure(
        &self,
        phase_id: &str,
        error: &PhaseFailure,
        _context: &JsonMap,
    ) -> anyhow::Result<Option<JsonMap>> {
        tracing::warn!("Phase {} failed: {}", phase_id, error);
        Ok(None)
    }

    async fn on_pause(&self, phase_id: &str, reason: &str) -> anyhow::Result<()> {
        tracing::info!("Phase {} paused: {}", phase_id, reason);
        Ok(())
    }

    async fn on_resume(&self, phase_id: &str) -> anyhow::Result<()> {
        tracing::info!("Phase {} resumed", phase_id);
        Ok(())
    }
}
