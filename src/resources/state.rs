//! 键值状态存储
//!
//! 协调器使用的键：`phase:<id>:state`、`phase_checkpoint:<checkpoint_id>`、
//! `phase_coordinator:circuit_breaker_configs`。值均为 JSON，无二进制格式。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::ResourceError;

/// 存储条目的资源类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    State,
    Checkpoint,
    Config,
}

/// 一条状态记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: Value,
    pub resource_type: ResourceType,
    #[serde(default)]
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StateEntry>, ResourceError>;

    async fn set(
        &self,
        key: &str,
        value: Value,
        resource_type: ResourceType,
        metadata: Option<Value>,
    ) -> Result<(), ResourceError>;

    async fn delete(&self, key: &str) -> Result<bool, ResourceError>;

    /// 按前缀列出条目（按 key 排序）
    async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<(String, StateEntry)>, ResourceError>;
}

/// 内存版状态存储
#[derive(Default)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<String, StateEntry>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn snapshot(&self) -> HashMap<String, StateEntry> {
        self.entries.read().await.clone()
    }
}

fn entry(value: Value, resource_type: ResourceType, metadata: Option<Value>) -> StateEntry {
    StateEntry {
        state: value,
        resource_type,
        metadata: metadata.unwrap_or(Value::Null),
        updated_at: Utc::now(),
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<StateEntry>, ResourceError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        resource_type: ResourceType,
        metadata: Option<Value>,
    ) -> Result<(), ResourceError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), entry(value, resource_type, metadata));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, ResourceError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<(String, StateEntry)>, ResourceError> {
        let mut found: Vec<(String, StateEntry)> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}

/// JSON 文件状态存储：整表落盘，每次写操作后重写文件
pub struct JsonFileStateStore {
    path: PathBuf,
    inner: InMemoryStateStore,
    /// 串行化落盘
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStateStore {
    /// 打开（或新建）存储文件
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ResourceError> {
        let path = path.as_ref().to_path_buf();
        let entries: HashMap<String, StateEntry> = match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            Ok(_) => HashMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!("Opened state store {} ({} entries)", path.display(), entries.len());

        Ok(Self {
            path,
            inner: InMemoryStateStore {
                entries: RwLock::new(entries),
            },
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self) -> Result<(), ResourceError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.inner.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for JsonFileStateStore {
    async fn get(&self, key: &str) -> Result<Option<StateEntry>, ResourceError> {
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        resource_type: ResourceType,
        metadata: Option<Value>,
    ) -> Result<(), ResourceError> {
        self.inner.set(key, value, resource_type, metadata).await?;
        self.flush().await
    }

    async fn delete(&self, key: &str) -> Result<bool, ResourceError> {
        let removed = self.inner.delete(key).await?;
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<(String, StateEntry)>, ResourceError> {
        self.inner.get_by_prefix(prefix).await
    }
}
