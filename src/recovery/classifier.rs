//! 错误分类

use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;

use super::types::{ErrorClassification, ErrorSeverity, JsonMap, OperationError};

/// 可插拔的错误分类器
#[async_trait::async_trait]
pub trait ErrorClassifier: Send + Sync {
    async fn classify(
        &self,
        error: &OperationError,
        component_id: &str,
        operation: &str,
    ) -> anyhow::Result<ErrorClassification>;

    /// 组件的该操作是否已超过强制清理阈值
    async fn requires_forced_cleanup(&self, component_id: &str, operation: &str) -> bool;
}

/// 分类阈值
#[derive(Debug, Clone, Copy)]
pub struct ClassifierThresholds {
    pub degraded_after: u32,
    pub fatal_after: u32,
    pub forced_cleanup_after: u32,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            degraded_after: 2,
            fatal_after: 5,
            forced_cleanup_after: 3,
        }
    }
}

/// 按 `component:operation` 计数的分类器：重复出错越多，严重度越高
pub struct CountingClassifier {
    counts: RwLock<HashMap<String, u32>>,
    thresholds: ClassifierThresholds,
}

impl CountingClassifier {
    pub fn new() -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
            thresholds: ClassifierThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: ClassifierThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn error_count(&self, component_id: &str, operation: &str) -> u32 {
        self.counts
            .read()
            .await
            .get(&key(component_id, operation))
            .copied()
            .unwrap_or(0)
    }

    pub async fn reset(&self, component_id: &str, operation: &str) {
        self.counts.write().await.remove(&key(component_id, operation));
    }

    fn severity_for(&self, count: u32) -> ErrorSeverity {
        if count > self.thresholds.fatal_after {
            ErrorSeverity::Fatal
        } else if count > self.thresholds.degraded_after {
            ErrorSeverity::Degraded
        } else {
            ErrorSeverity::Transient
        }
    }
}

impl Default for CountingClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn key(component_id: &str, operation: &str) -> String {
    format!("{component_id}:{operation}")
}

#[async_trait::async_trait]
impl ErrorClassifier for CountingClassifier {
    async fn classify(
        &self,
        error: &OperationError,
        component_id: &str,
        operation: &str,
    ) -> anyhow::Result<ErrorClassification> {
        let count = {
            let mut counts = self.counts.write().await;
            let entry = counts.entry(key(component_id, operation)).or_insert(0);
            *entry += 1;
            *entry
        };

        let severity = error.severity.unwrap_or_else(|| self.severity_for(count));
        let impact_score = error
            .impact_score
            .unwrap_or_else(|| severity.default_impact());

        let mut context = JsonMap::new();
        context.insert("operation".into(), json!(operation));
        context.insert("error_count".into(), json!(count));
        context.insert("message".into(), json!(error.message));
        if let Some(resource_id) = &error.resource_id {
            context.insert("resource_id".into(), json!(resource_id));
        }
        if let Some(correlation_id) = &error.correlation_id {
            context.insert("correlation_id".into(), json!(correlation_id));
        }
        for (k, v) in &error.details {
            context.entry(k.clone()).or_insert_with(|| v.clone());
        }

        Ok(ErrorClassification {
            severity,
            error_type: error.error_type.clone(),
            source: component_id.to_string(),
            impact_score,
            requires_intervention: severity == ErrorSeverity::Fatal,
            recovery_strategy: error.recovery_strategy.clone(),
            timestamp: Utc::now(),
            context,
            recovery_succeeded: None,
        })
    }

    async fn requires_forced_cleanup(&self, component_id: &str, operation: &str) -> bool {
        self.error_count(component_id, operation).await > self.thresholds.forced_cleanup_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_severity_escalates_with_repeats() {
        let classifier = CountingClassifier::new();
        let err = OperationError::new("IoError", "disk busy");

        let mut severities = Vec::new();
        for _ in 0..6 {
            let c = classifier.classify(&err, "store", "write").await.unwrap();
            severities.push(c.severity);
        }
        assert_eq!(
            severities,
            vec![
                ErrorSeverity::Transient,
                ErrorSeverity::Transient,
                ErrorSeverity::Degraded,
                ErrorSeverity::Degraded,
                ErrorSeverity::Degraded,
                ErrorSeverity::Fatal,
            ]
        );
        assert!(classifier.requires_forced_cleanup("store", "write").await);
        assert!(!classifier.requires_forced_cleanup("store", "read").await);
    }

    #[tokio::test]
    async fn test_explicit_severity_wins() {
        let classifier = CountingClassifier::new();
        let err = OperationError::resource_exhaustion("memory", 2000.0, 1000.0);
        let c = classifier.classify(&err, "cache", "load").await.unwrap();
        assert_eq!(c.severity, ErrorSeverity::Fatal);
        assert!(c.requires_intervention);
        assert_eq!(c.impact_score, 0.9);
        assert_eq!(c.context["limit"], 1000.0);

        classifier.reset("cache", "load").await;
        assert_eq!(classifier.error_count("cache", "load").await, 0);
    }
}
