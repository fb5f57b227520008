//! 阶段类型注册表
//!
//! 归协调器所有（随协调器创建），记录内置与自定义阶段类型及其熔断器。
//! 自定义类型 id 必须以 `phase_` 开头且不得与内置类型重名，可通过 parent_type 形成继承链
//! （仅用于查询展示，不参与行为分派）。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use super::types::{JsonMap, PhaseKind, PhaseType};
use crate::core::CoordinatorError;
use crate::resources::EventBus;

/// 自定义阶段类型 id 的保留前缀
pub const CUSTOM_PHASE_PREFIX: &str = "phase_";

/// 阶段间迁移（嵌套协调）使用的熔断器名
pub const TRANSITION_CIRCUIT: &str = "transition";

/// 已注册的自定义阶段类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPhaseType {
    pub id: String,
    pub description: String,
    pub parent_type: Option<String>,
    #[serde(default)]
    pub config: JsonMap,
    pub registered_at: DateTime<Utc>,
}

pub struct PhaseRegistry {
    custom: RwLock<HashMap<String, CustomPhaseType>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    /// 构造时的配置覆盖（对后注册的自定义类型同样生效）
    overrides: HashMap<String, CircuitBreakerConfig>,
    events: Option<Arc<dyn EventBus>>,
}

impl PhaseRegistry {
    pub fn new(events: Option<Arc<dyn EventBus>>) -> Self {
        let mut registry = Self {
            custom: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            overrides: HashMap::new(),
            events,
        };
        for name in PhaseType::ALL
            .into_iter()
            .map(|t| t.as_str())
            .chain(std::iter::once(TRANSITION_CIRCUIT))
        {
            let breaker = registry.build_breaker(name);
            registry
                .breakers
                .get_mut()
                .insert(name.to_string(), Arc::new(breaker));
        }
        registry
    }

    /// 构造期配置覆盖（独占访问，无需加锁）
    pub fn with_overrides(mut self, overrides: HashMap<String, CircuitBreakerConfig>) -> Self {
        self.overrides = overrides;
        let names: Vec<String> = self.breakers.get_mut().keys().cloned().collect();
        for name in names {
            let breaker = self.build_breaker(&name);
            self.breakers.get_mut().insert(name, Arc::new(breaker));
        }
        self
    }

    fn config_for(&self, name: &str, custom_config: Option<&JsonMap>) -> CircuitBreakerConfig {
        if let Some(config) = self.overrides.get(name) {
            return *config;
        }
        custom_config
            .and_then(|c| c.get("circuit_breaker"))
            .and_then(|v| serde_json::from_value::<CircuitBreakerConfig>(v.clone()).ok())
            .filter(|c| c.validate().is_ok())
            .unwrap_or_else(|| CircuitBreakerConfig::default_for(name))
    }

    fn build_breaker(&self, name: &str) -> CircuitBreaker {
        self.build_breaker_with(name, None)
    }

    fn build_breaker_with(&self, name: &str, custom_config: Option<&JsonMap>) -> CircuitBreaker {
        let breaker = CircuitBreaker::new(name, self.config_for(name, custom_config));
        match &self.events {
            Some(events) => breaker.with_events(events.clone()),
            None => breaker,
        }
    }

    /// 注册自定义类型；返回是否覆盖了已有注册
    pub async fn register_custom(
        &self,
        id: &str,
        description: &str,
        parent_type: Option<&str>,
        config: JsonMap,
    ) -> Result<bool, CoordinatorError> {
        if !id.starts_with(CUSTOM_PHASE_PREFIX) {
            return Err(CoordinatorError::InvalidPhaseType(format!(
                "custom phase type '{id}' must start with '{CUSTOM_PHASE_PREFIX}'"
            )));
        }
        if id.parse::<PhaseType>().is_ok() || id == TRANSITION_CIRCUIT {
            return Err(CoordinatorError::InvalidPhaseType(format!(
                "'{id}' collides with a built-in phase type"
            )));
        }
        if let Some(parent) = parent_type {
            if parent == id || !self.is_valid(parent).await {
                return Err(CoordinatorError::InvalidPhaseType(format!(
                    "unknown parent type '{parent}' for '{id}'"
                )));
            }
        }

        let breaker = Arc::new(self.build_breaker_with(id, Some(&config)));
        let entry = CustomPhaseType {
            id: id.to_string(),
            description: description.to_string(),
            parent_type: parent_type.map(str::to_string),
            config,
            registered_at: Utc::now(),
        };

        let replaced = self
            .custom
            .write()
            .await
            .insert(id.to_string(), entry)
            .is_some();
        self.breakers.write().await.insert(id.to_string(), breaker);
        Ok(replaced)
    }

    pub async fn unregister_custom(&self, id: &str) -> Option<CustomPhaseType> {
        let removed = self.custom.write().await.remove(id);
        if removed.is_some() {
            self.breakers.write().await.remove(id);
        }
        removed
    }

    pub async fn is_valid(&self, value: &str) -> bool {
        value.parse::<PhaseType>().is_ok() || self.custom.read().await.contains_key(value)
    }

    /// 把字符串解析为已知的阶段类型
    pub async fn resolve(&self, value: &str) -> Option<PhaseKind> {
        if let Ok(t) = value.parse::<PhaseType>() {
            return Some(PhaseKind::BuiltIn(t));
        }
        self.custom
            .read()
            .await
            .contains_key(value)
            .then(|| PhaseKind::Custom(value.to_string()))
    }

    pub async fn is_valid_kind(&self, kind: &PhaseKind) -> bool {
        match kind {
            PhaseKind::BuiltIn(_) => true,
            PhaseKind::Custom(id) => self.custom.read().await.contains_key(id),
        }
    }

    pub async fn custom_type(&self, id: &str) -> Option<CustomPhaseType> {
        self.custom.read().await.get(id).cloned()
    }

    pub async fn custom_types(&self) -> Vec<CustomPhaseType> {
        let mut all: Vec<_> = self.custom.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// 自定义类型的继承链：从自身开始，沿 parent_type 上溯（遇到环即停止）
    pub async fn inheritance_chain(&self, id: &str) -> Vec<String> {
        let custom = self.custom.read().await;
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(id.to_string());
        while let Some(type_id) = current {
            if !seen.insert(type_id.clone()) {
                break;
            }
            current = custom.get(&type_id).and_then(|t| t.parent_type.clone());
            chain.push(type_id);
        }
        chain
    }

    pub async fn inheritance_map(&self) -> BTreeMap<String, Vec<String>> {
        let ids: Vec<String> = self.custom.read().await.keys().cloned().collect();
        let mut map = BTreeMap::new();
        for id in ids {
            let chain = self.inheritance_chain(&id).await;
            map.insert(id, chain);
        }
        map
    }

    pub async fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(name).cloned()
    }

    pub async fn is_circuit_open(&self, name: &str) -> bool {
        match self.breaker(name).await {
            Some(b) => b.is_open().await,
            None => false,
        }
    }

    pub async fn breaker_snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(breakers.len());
        for b in breakers {
            snapshots.push(b.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// 所有熔断器当前配置（用于持久化）
    pub async fn configs(&self) -> BTreeMap<String, CircuitBreakerConfig> {
        let breakers: Vec<(String, Arc<CircuitBreaker>)> = self
            .breakers
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut configs = BTreeMap::new();
        for (name, breaker) in breakers {
            configs.insert(name, breaker.config().await);
        }
        configs
    }

    pub async fn update_config(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<(), CoordinatorError> {
        config.validate()?;
        let breaker = self
            .breaker(name)
            .await
            .ok_or_else(|| CoordinatorError::InvalidPhaseType(name.to_string()))?;
        breaker.update_config(config).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtin_breakers_exist() {
        let registry = PhaseRegistry::new(None);
        for t in PhaseType::ALL {
            assert!(registry.breaker(t.as_str()).await.is_some());
        }
        let two = registry.breaker("phase_two").await.unwrap();
        assert_eq!(two.config().await.failure_threshold, 5);
        assert!(registry.breaker(TRANSITION_CIRCUIT).await.is_some());
    }

    #[tokio::test]
    async fn test_register_rules() {
        let registry = PhaseRegistry::new(None);
        assert!(registry
            .register_custom("review", "no prefix", None, JsonMap::new())
            .await
            .is_err());
        assert!(registry
            .register_custom("phase_two", "collides", None, JsonMap::new())
            .await
            .is_err());
        assert!(registry
            .register_custom("phase_review", "review", Some("phase_nope"), JsonMap::new())
            .await
            .is_err());

        let replaced = registry
            .register_custom("phase_review", "review", Some("phase_two"), JsonMap::new())
            .await
            .unwrap();
        assert!(!replaced);
        let replaced = registry
            .register_custom("phase_review", "review v2", Some("phase_two"), JsonMap::new())
            .await
            .unwrap();
        assert!(replaced);
        assert!(registry.is_valid("phase_review").await);
        assert!(registry.breaker("phase_review").await.is_some());
    }

    #[tokio::test]
    async fn test_inheritance_chain() {
        let registry = PhaseRegistry::new(None);
        registry
            .register_custom("phase_base", "base", Some("phase_three"), JsonMap::new())
            .await
            .unwrap();
        registry
            .register_custom("phase_leaf", "leaf", Some("phase_base"), JsonMap::new())
            .await
            .unwrap();
        assert_eq!(
            registry.inheritance_chain("phase_leaf").await,
            vec!["phase_leaf", "phase_base", "phase_three"]
        );
        assert_eq!(registry.inheritance_map().await.len(), 2);
    }

    #[tokio::test]
    async fn test_overrides_and_custom_breaker_config() {
        let mut overrides = HashMap::new();
        overrides.insert("phase_one".to_string(), CircuitBreakerConfig::new(9, 10, 20));
        let registry = PhaseRegistry::new(None).with_overrides(overrides);
        assert_eq!(
            registry.breaker("phase_one").await.unwrap().config().await.failure_threshold,
            9
        );

        let mut config = JsonMap::new();
        config.insert(
            "circuit_breaker".into(),
            serde_json::json!({"failure_threshold": 2, "recovery_timeout_secs": 5, "failure_window_secs": 30}),
        );
        registry
            .register_custom("phase_fast", "fast", None, config)
            .await
            .unwrap();
        let fast = registry.breaker("phase_fast").await.unwrap().config().await;
        assert_eq!(fast, CircuitBreakerConfig::new(2, 5, 30));

        assert!(registry
            .update_config("phase_fast", CircuitBreakerConfig::new(0, 5, 30))
            .await
            .is_err());
        assert!(registry.unregister_custom("phase_fast").await.is_some());
        assert!(registry.breaker("phase_fast").await.is_none());
    }
}
