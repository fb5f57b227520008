//! 阶段检查点
//!
//! 检查点保存 PhaseContext 的完整快照，同时存放在内存与 StateStore（`phase_checkpoint:<id>`）。
//! 恢复是整体覆盖而非合并，并根据快照重建层级与依赖索引。

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::coordinator::PhaseCoordinator;
use super::types::{Checkpoint, JsonMap};
use crate::core::CoordinatorError;
use crate::resources::{EventPriority, EventType, ResourceType};

pub const CHECKPOINT_KEY_PREFIX: &str = "phase_checkpoint:";

impl PhaseCoordinator {
    /// 为阶段创建检查点，返回检查点 id
    pub async fn create_checkpoint(&self, phase_id: &str) -> Result<String, CoordinatorError> {
        let now = Utc::now();
        let checkpoint = {
            let mut state = self.state.write().await;
            let Some(ctx) = state.phases.get_mut(phase_id) else {
                return Err(CoordinatorError::UnknownPhase(phase_id.to_string()));
            };
            let checkpoint_id = format!(
                "checkpoint_{}_{}_{}",
                phase_id,
                ctx.phase_type.as_str(),
                &Uuid::new_v4().simple().to_string()[..8]
            );
            ctx.checkpoint_ids.push(checkpoint_id.clone());

            let mut metadata = JsonMap::new();
            metadata.insert("state".into(), json!(ctx.state));
            metadata.insert("checkpoint_count".into(), json!(ctx.checkpoint_ids.len()));
            let checkpoint = Checkpoint {
                checkpoint_id: checkpoint_id.clone(),
                phase_id: phase_id.to_string(),
                created_at: now,
                metadata,
                context: ctx.clone(),
            };
            state.checkpoints.insert(checkpoint_id, checkpoint.clone());
            checkpoint
        };

        let key = format!("{CHECKPOINT_KEY_PREFIX}{}", checkpoint.checkpoint_id);
        if let Err(e) = self
            .resources
            .state
            .set(
                &key,
                serde_json::to_value(&checkpoint)?,
                ResourceType::Checkpoint,
                Some(json!({"phase_id": phase_id})),
            )
            .await
        {
            tracing::warn!(
                "Checkpoint {} kept in memory only, persist failed: {}",
                checkpoint.checkpoint_id,
                e
            );
        }

        tracing::info!(
            "Created checkpoint {} for phase {} ({})",
            checkpoint.checkpoint_id,
            phase_id,
            checkpoint.context.state
        );
        self.emit_checkpoint_event("checkpoint_created", &checkpoint)
            .await;
        self.resources
            .metrics
            .record(
                "phase_coordinator:checkpoint_created",
                1.0,
                json!({"phase_id": phase_id, "checkpoint_id": checkpoint.checkpoint_id}),
            )
            .await;
        Ok(checkpoint.checkpoint_id)
    }

    /// 从检查点恢复；内存中没有时回退到 StateStore
    pub async fn restore_from_checkpoint(&self, checkpoint_id: &str) -> Result<(), CoordinatorError> {
        let checkpoint = self.load_checkpoint(checkpoint_id).await?;
        let phase_id = checkpoint.phase_id.clone();

        let (snapshot, previous) = {
            let mut state = self.state.write().await;
            let restored = checkpoint.context.clone();

            let previous = state.phases.get(&phase_id).map(|old| (old.state, old.parent_phase_id.clone()));
            if let Some((_, Some(old_parent))) = &previous {
                if restored.parent_phase_id.as_ref() != Some(old_parent) {
                    if let Some(children) = state.hierarchy.get_mut(old_parent) {
                        children.remove(&phase_id);
                    }
                    if let Some(parent) = state.phases.get_mut(old_parent) {
                        parent.child_phases.remove(&phase_id);
                    }
                }
            }

            state.phases.insert(phase_id.clone(), restored.clone());
            state.reindex(&restored);
            let restored = state.phases.get(&phase_id).cloned().unwrap_or(restored);
            state
                .checkpoints
                .entry(checkpoint_id.to_string())
                .or_insert(checkpoint.clone());
            (restored, previous.map(|(s, _)| s))
        };

        tracing::info!(
            "Restored phase {} from checkpoint {} (state {})",
            phase_id,
            checkpoint_id,
            snapshot.state
        );
        self.publish_state_change(&snapshot, previous.unwrap_or(snapshot.state))
            .await;
        self.emit_checkpoint_event("checkpoint_restored", &checkpoint)
            .await;
        Ok(())
    }

    /// restore_from_checkpoint 的包装：额外发布 rolled_back 事件与回滚指标
    pub async fn rollback_to_checkpoint(&self, checkpoint_id: &str) -> Result<(), CoordinatorError> {
        self.restore_from_checkpoint(checkpoint_id).await?;
        let checkpoint = self.load_checkpoint(checkpoint_id).await?;
        tracing::warn!(
            "Phase {} rolled back to checkpoint {}",
            checkpoint.phase_id,
            checkpoint_id
        );
        self.emit_checkpoint_event("rolled_back", &checkpoint).await;
        self.resources
            .metrics
            .record(
                "phase_coordinator:rollback",
                1.0,
                json!({"phase_id": checkpoint.phase_id, "checkpoint_id": checkpoint_id}),
            )
            .await;
        Ok(())
    }

    /// 某阶段的全部检查点，按创建时间排序
    pub async fn list_checkpoints(&self, phase_id: &str) -> Vec<Checkpoint> {
        let state = self.state.read().await;
        let mut checkpoints: Vec<_> = state
            .checkpoints
            .values()
            .filter(|c| c.phase_id == phase_id)
            .cloned()
            .collect();
        checkpoints.sort_by_key(|c| c.created_at);
        checkpoints
    }

    async fn load_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint, CoordinatorError> {
        if let Some(checkpoint) = self.state.read().await.checkpoints.get(checkpoint_id) {
            return Ok(checkpoint.clone());
        }
        let key = format!("{CHECKPOINT_KEY_PREFIX}{checkpoint_id}");
        match self.resources.state.get(&key).await? {
            Some(entry) => {
                tracing::debug!("Checkpoint {} loaded from state store", checkpoint_id);
                Ok(serde_json::from_value(entry.state)?)
            }
            None => Err(CoordinatorError::CheckpointNotFound(checkpoint_id.to_string())),
        }
    }

    async fn emit_checkpoint_event(&self, sub_type: &str, checkpoint: &Checkpoint) {
        self.resources
            .emit(
                EventType::PhaseCoordination,
                json!({
                    "event_type": sub_type,
                    "phase_id": checkpoint.phase_id,
                    "checkpoint_id": checkpoint.checkpoint_id,
                    "state": checkpoint.context.state,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
                EventPriority::Normal,
            )
            .await;
    }
}
